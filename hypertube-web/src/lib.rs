//! Hypertube Web - byte-range streaming server

#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! JSON API and `Range`-aware media endpoint over the download sessions of
//! `hypertube-core`. Players can seek into a file while it is still being
//! downloaded; requests for missing bytes wait for the swarm to deliver them.

pub mod error;
pub mod handlers;
pub mod server;

// Re-export main types
pub use error::ApiError;
pub use server::{AppState, build_router, run_server};
