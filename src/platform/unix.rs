use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use tokio::process::Command;
use tracing::debug;

/// Put the child in its own process group and tie it to our lifetime.
///
/// The group lets a kill reach everything the command forks.
pub fn prepare_command(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if set_process_group() != 0 {
                return Err(io::Error::last_os_error());
            }

            // Set parent death signal on Linux
            #[cfg(target_os = "linux")]
            {
                if set_parent_death_signal() != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }
}

/// Signal the whole process group led by `pid`. A group that is already
/// gone counts as delivered.
pub fn signal_group(pid: u32, sig: Signal) -> io::Result<()> {
    match signal::killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {
            debug!(pid, signal = sig.as_str(), "signalled process group");
            Ok(())
        }
        Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

pub fn request_stop(pid: u32) -> io::Result<()> {
    signal_group(pid, Signal::SIGTERM)
}

pub fn force_stop(pid: u32) -> io::Result<()> {
    signal_group(pid, Signal::SIGKILL)
}

/// Encapsulates unsafe setpgid call
unsafe fn set_process_group() -> libc::c_int {
    unsafe { libc::setpgid(0, 0) }
}

/// Encapsulates unsafe prctl call
#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> libc::c_int {
    unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn test_group_signal_reaches_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30").stdout(Stdio::null());
        prepare_command(&mut cmd);
        let mut child = cmd.spawn().expect("spawn sleep");
        let pid = child.id().expect("pid");

        request_stop(pid).expect("sigterm");
        let status = child.wait().await.expect("wait");
        assert!(!status.success());
        // Already reaped: delivering again is not an error
        force_stop(pid).expect("sigkill after exit");
    }
}
