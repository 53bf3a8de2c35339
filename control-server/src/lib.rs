// control-server/src/lib.rs

pub mod auth;
pub mod bridge;
pub mod error;
pub mod http;
pub mod server;
pub mod ws;
