// control-server/src/ws/mod.rs

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod manager;
