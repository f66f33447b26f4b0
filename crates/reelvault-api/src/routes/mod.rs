//! HTTP route modules

pub mod config;
pub mod events;
pub mod jobs;
pub mod phases;
pub mod stream;
