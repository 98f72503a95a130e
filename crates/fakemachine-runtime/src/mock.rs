//! In-memory host and launcher for exercising backends without touching the
//! real system. `MockLauncher` records every launch, can inject a failure at
//! any step, and tracks which children and socket endpoints are still alive.

use crate::host::Host;
use crate::launch::{Endpoint, LaunchCommand, Launcher, Supervised};
use std::collections::HashSet;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default)]
pub struct MockHost {
    paths: HashSet<PathBuf>,
    denied: HashSet<PathBuf>,
    release: Option<String>,
    merged_usr: bool,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(path.into());
        self
    }

    /// `path` exists but stat fails with `PermissionDenied`.
    #[must_use]
    pub fn with_denied(mut self, path: impl Into<PathBuf>) -> Self {
        self.denied.insert(path.into());
        self
    }

    #[must_use]
    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release = Some(release.into());
        self
    }

    #[must_use]
    pub fn with_merged_usr(mut self, merged: bool) -> Self {
        self.merged_usr = merged;
        self
    }
}

impl Host for MockHost {
    fn stat(&self, path: &Path) -> std::io::Result<()> {
        if self.denied.contains(path) {
            Err(std::io::ErrorKind::PermissionDenied.into())
        } else if self.paths.contains(path) {
            Ok(())
        } else {
            Err(std::io::ErrorKind::NotFound.into())
        }
    }

    fn kernel_release(&self) -> std::io::Result<String> {
        self.release
            .clone()
            .ok_or_else(|| std::io::ErrorKind::NotFound.into())
    }

    fn merged_usr(&self) -> bool {
        self.merged_usr
    }
}

/// Step at which `MockLauncher` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    SocketPair,
    /// Fail the n-th spawn (0-based).
    Spawn(usize),
    /// Fail waiting on any child that has not been killed.
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedLaunch {
    pub pid: u32,
    pub program: PathBuf,
    pub argv0: String,
    pub args: Vec<String>,
    pub passed_fd: bool,
}

#[derive(Debug, Default)]
struct MockState {
    spawns: usize,
    launches: Vec<RecordedLaunch>,
    running: Vec<u32>,
    killed: Vec<u32>,
    endpoints_created: usize,
    live_endpoints: usize,
}

#[derive(Debug, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
    fault: Option<Fault>,
    exit_code: i32,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Exit code reported by every child that exits on its own.
    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn launches(&self) -> Vec<RecordedLaunch> {
        lock(&self.state).launches.clone()
    }

    /// Pids of children that have been spawned and neither killed nor reaped.
    pub fn running(&self) -> Vec<u32> {
        lock(&self.state).running.clone()
    }

    pub fn killed(&self) -> Vec<u32> {
        lock(&self.state).killed.clone()
    }

    pub fn endpoints_created(&self) -> usize {
        lock(&self.state).endpoints_created
    }

    /// Endpoints handed out by `socket_pair` that have not been dropped.
    pub fn live_endpoints(&self) -> usize {
        lock(&self.state).live_endpoints
    }
}

impl Launcher for MockLauncher {
    fn socket_pair(&self) -> std::io::Result<(Endpoint, Endpoint)> {
        if self.fault == Some(Fault::SocketPair) {
            return Err(std::io::Error::from_raw_os_error(libc::EMFILE));
        }
        let (a, b) = UnixDatagram::pair()?;
        let mut state = lock(&self.state);
        state.endpoints_created += 2;
        state.live_endpoints += 2;
        drop(state);
        let a: Endpoint = Box::new(TrackedEndpoint {
            socket: a,
            state: Arc::clone(&self.state),
        });
        let b: Endpoint = Box::new(TrackedEndpoint {
            socket: b,
            state: Arc::clone(&self.state),
        });
        Ok((a, b))
    }

    fn spawn(&self, command: &LaunchCommand<'_>) -> std::io::Result<Box<dyn Supervised>> {
        let mut state = lock(&self.state);
        let nth = state.spawns;
        state.spawns += 1;
        if self.fault == Some(Fault::Spawn(nth)) {
            return Err(std::io::ErrorKind::NotFound.into());
        }

        let pid = 1000 + nth as u32;
        state.launches.push(RecordedLaunch {
            pid,
            program: command.program.clone(),
            argv0: command.argv0.clone(),
            args: command.args.clone(),
            passed_fd: command.passed_fd.is_some(),
        });
        state.running.push(pid);

        Ok(Box::new(MockChild {
            pid,
            state: Arc::clone(&self.state),
            exit_code: self.exit_code,
            fail_wait: self.fault == Some(Fault::Wait),
        }))
    }
}

struct TrackedEndpoint {
    socket: UnixDatagram,
    state: Arc<Mutex<MockState>>,
}

impl AsFd for TrackedEndpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl Drop for TrackedEndpoint {
    fn drop(&mut self) {
        lock(&self.state).live_endpoints -= 1;
    }
}

struct MockChild {
    pid: u32,
    state: Arc<Mutex<MockState>>,
    exit_code: i32,
    fail_wait: bool,
}

impl Supervised for MockChild {
    fn id(&self) -> u32 {
        self.pid
    }

    fn wait(&mut self) -> std::io::Result<i32> {
        let mut state = lock(&self.state);
        let killed = state.killed.contains(&self.pid);
        if self.fail_wait && !killed {
            return Err(std::io::Error::from_raw_os_error(libc::EINTR));
        }
        state.running.retain(|p| *p != self.pid);
        Ok(if killed { 128 + libc::SIGKILL } else { self.exit_code })
    }

    fn kill(&mut self) -> std::io::Result<()> {
        let mut state = lock(&self.state);
        state.running.retain(|p| *p != self.pid);
        state.killed.push(self.pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_reports_configured_paths() {
        let host = MockHost::new().with_path("/dev/kvm");
        assert!(host.stat(Path::new("/dev/kvm")).is_ok());
        let err = host.stat(Path::new("/dev/null")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

        let host = host.with_denied("/dev/kvm");
        let err = host.stat(Path::new("/dev/kvm")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn host_without_release_fails() {
        assert!(MockHost::new().kernel_release().is_err());
        assert_eq!(
            MockHost::new().with_release("6.1").kernel_release().unwrap(),
            "6.1"
        );
    }

    #[test]
    fn endpoints_are_tracked() {
        let launcher = MockLauncher::new();
        let (a, b) = launcher.socket_pair().unwrap();
        assert_eq!(launcher.live_endpoints(), 2);
        drop(a);
        assert_eq!(launcher.live_endpoints(), 1);
        drop(b);
        assert_eq!(launcher.live_endpoints(), 0);
        assert_eq!(launcher.endpoints_created(), 2);
    }

    #[test]
    fn spawn_fault_hits_requested_launch() {
        let launcher = MockLauncher::new().with_fault(Fault::Spawn(1));
        assert!(launcher.spawn(&LaunchCommand::new("/a", "a")).is_ok());
        assert!(launcher.spawn(&LaunchCommand::new("/b", "b")).is_err());
        assert_eq!(launcher.launches().len(), 1);
        assert_eq!(launcher.launches()[0].program, PathBuf::from("/a"));
    }

    #[test]
    fn killed_child_reports_signal_exit() {
        let launcher = MockLauncher::new().with_fault(Fault::Wait);
        let mut child = launcher.spawn(&LaunchCommand::new("/a", "a")).unwrap();
        assert!(child.wait().is_err());
        child.kill().unwrap();
        assert_eq!(child.wait().unwrap(), 137);
        assert!(launcher.running().is_empty());
    }
}
