use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{info, warn};

use crate::{Error, Result};

/// The lifecycle every supervised child exposes, independent of what runs
/// inside it.
///
/// `launch` is idempotent, `stop` must complete in bounded time, `is_alive`
/// is truthy only while the underlying OS process is actually running.
pub trait ManagedChild: Send {
    /// A short, human-readable name used in logs and the supervisor
    /// registry.
    fn name(&self) -> &str;
    fn launch(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn is_alive(&mut self) -> bool;
}

/// A [`ManagedChild`] whose routine runs in its own `fork`ed OS process.
///
/// `fork` is used instead of re-executing the binary because the routine
/// closure already carries the fully-constructed analyzer/source/sink
/// capability objects; `fork`'s copy-on-write semantics hand them to the
/// child for free, mirroring the reference deployment's default
/// `multiprocessing.Process` fork start method on Linux. Channels and
/// contexts are never inherited: the routine is expected to build its own
/// inside the new process, before the fork, state only flows in via the
/// closure's captures.
pub struct ProcessChild {
    name: String,
    routine: Box<dyn FnMut() + Send + 'static>,
    pid: Option<Pid>,
}

impl ProcessChild {
    pub fn new<F>(name: impl Into<String>, routine: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self {
            name: name.into(),
            routine: Box::new(routine),
            pid: None,
        }
    }
}

impl ManagedChild for ProcessChild {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&mut self) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }
        // Safety: the child branch never returns across the fork; it runs
        // the routine to completion and calls `process::exit` directly.
        match unsafe { fork() }.map_err(|e| Error::Config(format!("fork failed: {e}")))? {
            ForkResult::Parent { child } => {
                self.pid = Some(child);
                info!(child = %self.name, pid = %child.as_raw(), "process launched");
                Ok(())
            }
            ForkResult::Child => {
                (self.routine)();
                std::process::exit(0);
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        let Some(pid) = self.pid.take() else {
            return Ok(());
        };
        if matches!(
            waitpid(pid, Some(WaitPidFlag::WNOHANG)),
            Ok(WaitStatus::StillAlive)
        ) {
            let _ = signal::kill(pid, Signal::SIGTERM);
            if let Err(e) = waitpid(pid, None) {
                warn!(child = %self.name, "waitpid after SIGTERM failed: {e}");
            }
        }
        info!(child = %self.name, "process stopped");
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            _ => {
                self.pid = None;
                false
            }
        }
    }
}

/// Test-only [`ManagedChild`] that runs its routine on an OS thread instead
/// of forking a process.
///
/// Real threads can't be forcibly killed, so `stop` relies on the routine
/// observing the shared `keep_running` flag (or, for [`crate::fabric::LoopbackFabric`]
/// routines, the channel it blocks on being torn down elsewhere) and
/// returning on its own within a short bounded wait.
pub struct ThreadChild<F>
where
    F: Fn(Arc<AtomicBool>) + Send + Sync + 'static,
{
    name: String,
    factory: Arc<F>,
    keep_running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl<F> ThreadChild<F>
where
    F: Fn(Arc<AtomicBool>) + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, routine: F) -> Self {
        Self {
            name: name.into(),
            factory: Arc::new(routine),
            keep_running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl<F> ManagedChild for ThreadChild<F>
where
    F: Fn(Arc<AtomicBool>) + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&mut self) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }
        self.keep_running.store(true, Ordering::SeqCst);
        let flag = self.keep_running.clone();
        let factory = self.factory.clone();
        self.handle = Some(std::thread::spawn(move || factory(flag)));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(child = %self.name, "thread child did not stop within the grace period");
            }
        }
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match &self.handle {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }
}
