// control-server/src/http/page.rs

/// Browser control console, compiled into the binary so the server has no
/// filesystem dependency on the device.
pub const CONTROL_PAGE: &str = include_str!("../../static/control.html");
