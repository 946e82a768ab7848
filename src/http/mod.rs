//! HTTP surface (spec §6), kept thin: routing, auth, and (de)serialization
//! live here; the actual work is delegated to the core components.

pub mod auth;
pub mod geosubmit_legacy;
pub mod locate;
pub mod report_submit;

use actix_web::web;

/// Routes requiring the bearer-token middleware (spec §6: locate, report).
pub fn authenticated_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(locate::locate).service(report_submit::report);
}

/// Routes reachable without authentication (spec §6: "none (restricted
/// network)").
pub fn public_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(geosubmit_legacy::geosubmit);
}
