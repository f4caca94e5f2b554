//! Opas daemon runtime: daily scheduler + pipeline processor + socket server.

mod error;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod schedule;

pub use error::DaemonError;
pub use protocol::{
    request_run, request_status, request_stop, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking};
