//! OS-specific process control.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{force_stop, prepare_command, request_stop, signal_group};

#[cfg(not(unix))]
mod fallback {
    use std::io;
    use tokio::process::Command;

    pub fn prepare_command(_cmd: &mut Command) {}

    // Without process groups the supervisor falls back to killing the
    // direct child through its handle.
    pub fn request_stop(_pid: u32) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    pub fn force_stop(_pid: u32) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

#[cfg(not(unix))]
pub use fallback::{force_stop, prepare_command, request_stop};
