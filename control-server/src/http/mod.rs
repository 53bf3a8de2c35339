// control-server/src/http/mod.rs

pub mod page;
pub mod request;
pub mod response;
pub mod router;
