//! Callflow — survey flow engine and call/campaign orchestrator.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod store;
pub mod survey;
