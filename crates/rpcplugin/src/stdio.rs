//! Temporary redirection of the process-wide stdout and stderr.
//!
//! While a plugin server is running, its real stdout belongs to the
//! handshake protocol and nothing else. [`StdioRedirect`] points file
//! descriptors 1 and 2 at in-process pipes for the duration of the serve
//! call, keeps a handle on the original stdout for writing the handshake
//! line, and restores both descriptors when dropped, so restoration happens
//! on every exit path including unwinds.
//!
//! The read ends of the pipes are retained but not consumed here; they
//! carry anything the plugin code prints while serving.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// RAII guard over the stdio redirection.
pub(crate) struct StdioRedirect {
    saved_stdout: OwnedFd,
    saved_stderr: OwnedFd,
    handshake_out: File,
    stdout_pipe: File,
    stderr_pipe: File,
}

impl StdioRedirect {
    /// Swap fds 1 and 2 for fresh pipes, saving the originals.
    pub(crate) fn install() -> io::Result<Self> {
        // Flush whatever is buffered before the descriptors change hands.
        io::stdout().flush()?;
        io::stderr().flush()?;

        let saved_stdout = dup_fd(libc::STDOUT_FILENO)?;
        let saved_stderr = dup_fd(libc::STDERR_FILENO)?;

        let (stdout_read, stdout_write) = pipe_fds()?;
        let (stderr_read, stderr_write) = pipe_fds()?;

        dup2_fd(stdout_write.as_raw_fd(), libc::STDOUT_FILENO)?;
        dup2_fd(stderr_write.as_raw_fd(), libc::STDERR_FILENO)?;
        // The write ends now live on fds 1 and 2; the originals can go.
        drop(stdout_write);
        drop(stderr_write);

        let handshake_out = File::from(dup_fd(saved_stdout.as_raw_fd())?);

        Ok(Self {
            saved_stdout,
            saved_stderr,
            handshake_out,
            stdout_pipe: File::from(stdout_read),
            stderr_pipe: File::from(stderr_read),
        })
    }

    /// The original stdout, reserved for the handshake line.
    pub(crate) fn handshake_out(&mut self) -> &mut File {
        &mut self.handshake_out
    }

    #[cfg(test)]
    pub(crate) fn stdout_pipe(&mut self) -> &mut File {
        &mut self.stdout_pipe
    }

    #[cfg(test)]
    pub(crate) fn stderr_pipe(&mut self) -> &mut File {
        &mut self.stderr_pipe
    }
}

impl Drop for StdioRedirect {
    fn drop(&mut self) {
        // Restoration is best-effort: there is nowhere left to report a
        // failure to, and the saved descriptors are known-good.
        let _ = dup2_fd(self.saved_stdout.as_raw_fd(), libc::STDOUT_FILENO);
        let _ = dup2_fd(self.saved_stderr.as_raw_fd(), libc::STDERR_FILENO);
    }
}

fn dup_fd(fd: RawFd) -> io::Result<OwnedFd> {
    let duped = unsafe { libc::dup(fd) };
    if duped < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}

fn dup2_fd(src: RawFd, dst: RawFd) -> io::Result<()> {
    if unsafe { libc::dup2(src, dst) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn pipe_fds() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read, write))
}
