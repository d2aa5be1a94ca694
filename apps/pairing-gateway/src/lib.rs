//! HTTP front for a single paired messaging session.
//!
//! The router exposes status, pairing and send endpoints over a
//! [`gsm_session::ConnectionManager`]; [`run`] wires the configured session
//! provider, serves HTTP and releases the session on shutdown.

pub mod config;
pub mod dev_provider;
pub mod error;
pub mod http;
pub mod render;
mod main_logic;

pub use main_logic::run;
