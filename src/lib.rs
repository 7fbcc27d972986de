//! Library crate for lan-inventory-rs: the scan pipeline, its collaborators
//! and the HTTP/WebSocket surface.
pub mod classify;
pub mod config;
pub mod discover;
pub mod error;
pub mod netdetect;
pub mod orchestrator;
pub mod ports;
pub mod probe;
pub mod progress;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
pub mod vendor;

pub use error::{Error, Result};
