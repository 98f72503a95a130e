use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

/// Descriptor number under which a passed endpoint appears in the child.
pub const PASSED_FD: RawFd = 3;

/// One end of a socket pair. Dropping it closes the descriptor.
pub type Endpoint = Box<dyn AsFd + Send>;

/// A process to start with the supervisor's stdio inherited.
#[derive(Debug)]
pub struct LaunchCommand<'a> {
    pub program: PathBuf,
    pub argv0: String,
    pub args: Vec<String>,
    /// Handed to the child as descriptor [`PASSED_FD`].
    pub passed_fd: Option<BorrowedFd<'a>>,
}

impl<'a> LaunchCommand<'a> {
    pub fn new(program: impl Into<PathBuf>, argv0: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            argv0: argv0.into(),
            args: Vec::new(),
            passed_fd: None,
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn pass_fd(mut self, fd: BorrowedFd<'a>) -> Self {
        self.passed_fd = Some(fd);
        self
    }
}

/// A running child process.
pub trait Supervised: Send {
    fn id(&self) -> u32;

    /// Block until the process exits and return its exit code.
    fn wait(&mut self) -> std::io::Result<i32>;

    fn kill(&mut self) -> std::io::Result<()>;
}

/// Creates the OS resources a backend needs to run a guest.
pub trait Launcher: Send + Sync {
    /// A connected pair of local datagram sockets.
    fn socket_pair(&self) -> std::io::Result<(Endpoint, Endpoint)>;

    fn spawn(&self, command: &LaunchCommand<'_>) -> std::io::Result<Box<dyn Supervised>>;
}

pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn socket_pair(&self) -> std::io::Result<(Endpoint, Endpoint)> {
        let (a, b) = UnixDatagram::pair()?;
        let a: Endpoint = Box::new(a);
        let b: Endpoint = Box::new(b);
        Ok((a, b))
    }

    fn spawn(&self, command: &LaunchCommand<'_>) -> std::io::Result<Box<dyn Supervised>> {
        let mut cmd = Command::new(&command.program);
        cmd.arg0(&command.argv0)
            .args(&command.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        if let Some(fd) = command.passed_fd {
            pass_fd(&mut cmd, fd.as_raw_fd());
        }

        let child = cmd.spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }
}

/// Make `fd` available to the child as [`PASSED_FD`]. Sockets from
/// `UnixDatagram::pair` are close-on-exec, so the descriptor must either be
/// duplicated (dup2 clears the flag) or have the flag removed in place.
#[allow(unsafe_code)]
fn pass_fd(cmd: &mut Command, fd: RawFd) {
    // SAFETY: the hook runs between fork and exec and only calls dup2/fcntl,
    // which are async-signal-safe and touch no memory of the parent.
    unsafe {
        cmd.pre_exec(move || {
            if fd == PASSED_FD {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(fd, PASSED_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

struct ChildProcess {
    child: Child,
}

impl Supervised for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn wait(&mut self) -> std::io::Result<i32> {
        Ok(exit_code(self.child.wait()?))
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill()
    }
}

/// Shell convention: a child killed by a signal reports 128 + signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Owns a child for the duration of a call frame. A child that has not been
/// waited for successfully is killed and reaped when the guard drops.
pub struct ProcessGuard {
    what: &'static str,
    child: Option<Box<dyn Supervised>>,
}

impl ProcessGuard {
    pub fn new(what: &'static str, child: Box<dyn Supervised>) -> Self {
        Self {
            what,
            child: Some(child),
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    pub fn wait(&mut self) -> std::io::Result<i32> {
        let Some(child) = self.child.as_mut() else {
            return Err(std::io::Error::other(format!(
                "{} has already been reaped",
                self.what
            )));
        };
        let code = child.wait()?;
        self.child = None;
        Ok(code)
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();
        tracing::debug!(pid, "terminating {}", self.what);
        if let Err(e) = child.kill() {
            tracing::warn!(pid, "failed to kill {}: {e}", self.what);
        }
        if let Err(e) = child.wait() {
            tracing::warn!(pid, "failed to reap {}: {e}", self.what);
        }
    }
}
