//! Platform-specific graceful stop.
//!
//! A spawned dependency leads its own process group, so a stop request reaches
//! launcher scripts and the JVM or server they exec. On Unix the group gets
//! SIGTERM; on Windows it gets a console CTRL_BREAK event.

use std::fmt::Debug;
use std::io;
use tokio::process::{Child, Command};
use tracing::debug;

pub trait GracefulStop: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare a command before spawn so the stop request can reach it.
    fn configure(&self, command: &mut Command);

    /// Ask the child to exit. Must not wait for the exit.
    fn request_stop(&self, child: &mut Child) -> io::Result<()>;

    /// Unconditional kill, used once the grace period has passed.
    fn force_stop(&self, child: &mut Child) -> io::Result<()> {
        child.start_kill()
    }
}

/// Sends SIGTERM to the child's process group.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessGroupSignal;

#[cfg(unix)]
impl GracefulStop for ProcessGroupSignal {
    fn name(&self) -> &'static str {
        "SIGTERM to process group"
    }

    fn configure(&self, command: &mut Command) {
        command.process_group(0);
    }

    fn request_stop(&self, child: &mut Child) -> io::Result<()> {
        match child.id() {
            Some(pid) => signal_group(pid, libc::SIGTERM),
            None => Ok(()),
        }
    }

    fn force_stop(&self, child: &mut Child) -> io::Result<()> {
        match child.id() {
            Some(pid) => signal_group(pid, libc::SIGKILL),
            None => Ok(()),
        }
    }
}

#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: i32) -> io::Result<()> {
    let pgid = i32::try_from(pid).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {pid}: exceeds i32 range"),
        )
    })?;
    debug!("sending signal {signal} to process group {pgid}");
    // SAFETY: kill() with a negative pid addresses the group created at spawn; pid validated above.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret != 0 {
        let errno = io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::ESRCH) {
            debug!("process group {pgid} already gone");
            return Ok(());
        }
        return Err(errno);
    }
    Ok(())
}

/// Sends CTRL_BREAK to the child's console process group.
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleBreak;

#[cfg(windows)]
impl GracefulStop for ConsoleBreak {
    fn name(&self) -> &'static str {
        "CTRL_BREAK to process group"
    }

    fn configure(&self, command: &mut Command) {
        use windows::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP.0);
    }

    fn request_stop(&self, child: &mut Child) -> io::Result<()> {
        use windows::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

        let Some(pid) = child.id() else {
            return Ok(());
        };
        debug!("sending CTRL_BREAK to process group {pid}");
        // SAFETY: plain Win32 call; a group id that no longer exists only yields an error.
        #[allow(unsafe_code)]
        let sent = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
        sent.map_err(io::Error::from)
    }
}

/// The stop strategy for the current platform.
pub fn platform_graceful_stop() -> Box<dyn GracefulStop> {
    #[cfg(unix)]
    {
        Box::new(ProcessGroupSignal)
    }
    #[cfg(windows)]
    {
        Box::new(ConsoleBreak)
    }
}
