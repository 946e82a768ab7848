//! Operational CLI subcommands (SPEC_FULL.md §B.3), kept out of `main.rs`
//! for the same reason the teacher splits them: each is independently
//! runnable maintenance, not part of the request-serving path.

pub mod archive;
pub mod import_cells;
pub mod stats;
