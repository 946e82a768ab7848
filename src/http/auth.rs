//! Bearer-token authentication (spec §6): constant-time comparison against
//! the configured secret, HTTP 401 on mismatch or absence.

use actix_web::dev::ServiceRequest;
use actix_web_httpauth::extractors::bearer::BearerAuth;
use actix_web_httpauth::extractors::AuthenticationError;
use subtle::ConstantTimeEq;

/// Validator passed to [`actix_web_httpauth::middleware::HttpAuthentication::bearer`].
pub async fn validator(
    req: ServiceRequest,
    credentials: BearerAuth,
) -> Result<ServiceRequest, (actix_web::Error, ServiceRequest)> {
    let expected = req
        .app_data::<actix_web::web::Data<String>>()
        .expect("auth token must be registered as app_data")
        .as_bytes();
    let got = credentials.token().as_bytes();

    let matches = got.len() == expected.len() && got.ct_eq(expected).into();
    if matches {
        Ok(req)
    } else {
        let challenge = actix_web_httpauth::headers::www_authenticate::bearer::Bearer::new();
        Err((AuthenticationError::new(challenge).into(), req))
    }
}
