//! Spawning and terminating the external ffmpeg process.

use std::env;
use std::io;
use std::process::Stdio;

use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

pub const DEFAULT_ENCODER_BIN: &str = "ffmpeg";

/// A launched encoder: its diagnostic output plus, for real processes, the
/// child handle used to reap and terminate it.
pub struct EncoderHandle {
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub child: Option<Child>,
}

impl EncoderHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}

/// Seam between the session manager and the operating system, so tests can
/// substitute a scripted encoder.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, args: &[String]) -> io::Result<EncoderHandle>;

    /// Executable name, used only by the kill-by-name fallback.
    fn program(&self) -> &str {
        DEFAULT_ENCODER_BIN
    }
}

pub struct FfmpegLauncher {
    program: String,
}

impl FfmpegLauncher {
    pub fn from_env() -> Self {
        FfmpegLauncher {
            program: env::var("FFMPEG_BIN").unwrap_or_else(|_| DEFAULT_ENCODER_BIN.to_string()),
        }
    }
}

impl Launcher for FfmpegLauncher {
    fn program(&self) -> &str {
        &self.program
    }

    fn launch(&self, args: &[String]) -> io::Result<EncoderHandle> {
        // ffmpeg writes all diagnostics (progress counters included) to
        // stderr; stdout carries nothing we want.
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "encoder stderr not captured"))?;
        Ok(EncoderHandle {
            output: Box::new(stderr),
            child: Some(child),
        })
    }
}

/// Asks the encoder we spawned to shut down. A process that already exited
/// counts as success.
pub fn terminate(pid: u32) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Last-resort fallback when signalling the owned pid fails: terminates
/// every process with the encoder's name on the host.
pub fn kill_by_name(program: &str) -> io::Result<()> {
    let status = std::process::Command::new("pkill")
        .arg("-9")
        .arg(program)
        .status()?;
    // pkill exits 1 when nothing matched, which is fine here
    match status.code() {
        Some(0) | Some(1) => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("pkill {} failed: {}", program, status),
        )),
    }
}
