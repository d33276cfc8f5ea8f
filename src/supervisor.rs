use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bma_ts::Monotonic;
use tracing::{error, info};

use crate::locking::Mutex;
use crate::process::ManagedChild;
use crate::{Error, Result};

/// How many times, how often, and over what window a child may be
/// relaunched after a crash.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub n_restart: u32,
    pub restart_delay: Duration,
    pub reset_window: Duration,
}

impl Default for RestartPolicy {
    /// The reference deployment's defaults: 3 restarts, 5 s apart, counted
    /// within a rolling 60 s window.
    fn default() -> Self {
        Self {
            n_restart: 3,
            restart_delay: Duration::from_secs(5),
            reset_window: Duration::from_secs(60),
        }
    }
}

struct RestartState {
    policy: RestartPolicy,
    restart_count: u32,
    last_restart: Option<Monotonic>,
    reset_deadline: Monotonic,
}

struct ChildEntry {
    child: Mutex<Box<dyn ManagedChild>>,
    state: Mutex<RestartState>,
    stop_signal: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Owns every child process, its restart policy, and its liveness monitor.
///
/// Registration order is preserved and used by [`Supervisor::start_all_processes`];
/// children are otherwise addressed by the unique name each
/// [`ManagedChild`] reports through [`ManagedChild::name`].
#[derive(Default)]
pub struct Supervisor {
    order: Vec<String>,
    entries: HashMap<String, Arc<ChildEntry>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a child with its restart policy. Rejects a name that is
    /// already registered.
    pub fn add_process(&mut self, child: Box<dyn ManagedChild>, policy: RestartPolicy) -> Result<()> {
        let name = child.name().to_string();
        if self.entries.contains_key(&name) {
            return Err(Error::Config(format!("process already registered: {name}")));
        }
        let now = Monotonic::now();
        let entry = Arc::new(ChildEntry {
            child: Mutex::new(child),
            state: Mutex::new(RestartState {
                policy,
                restart_count: 0,
                last_restart: None,
                reset_deadline: now + policy.reset_window,
            }),
            stop_signal: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
        });
        self.order.push(name.clone());
        self.entries.insert(name, entry);
        Ok(())
    }

    /// Starts every registered child in registration order, sleeping
    /// `delay` between each launch.
    pub fn start_all_processes(&self, delay: Duration) -> Result<()> {
        for name in &self.order {
            self.start_process(name)?;
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        Ok(())
    }

    /// Launches a single registered child if it is not already alive.
    pub fn start_process(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let mut child = entry.child.lock();
        if child.is_alive() {
            info!(child = name, "process is already running");
        } else {
            child.launch()?;
            info!(child = name, "process started");
        }
        Ok(())
    }

    /// Applies the restart policy to a named child: resets the restart
    /// counter if the reset window elapsed, then relaunches if the budget
    /// allows, or abandons the child otherwise.
    pub fn restart_process(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        match restart(name, &entry)? {
            true => Ok(()),
            false => Err(Error::RestartBudgetExhausted(name.to_string())),
        }
    }

    /// Stops a child: signals its monitor, stops the process, joins the
    /// monitor, and removes the child from the registry.
    pub fn stop_process(&mut self, name: &str) -> Result<()> {
        let Some(entry) = self.entries.remove(name) else {
            return Err(Error::Config(format!("process not registered: {name}")));
        };
        self.order.retain(|n| n != name);
        entry.stop_signal.store(true, Ordering::SeqCst);
        entry.child.lock().stop()?;
        if let Some(handle) = entry.monitor.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Spawns a monitoring thread for every registered child that does not
    /// already have one.
    pub fn monitor_processes(&self) {
        for name in &self.order {
            let Some(entry) = self.entries.get(name) else {
                continue;
            };
            let mut monitor = entry.monitor.lock();
            if monitor.is_none() {
                let handle = spawn_monitor(name.clone(), entry.clone());
                *monitor = Some(handle);
                info!(child = name.as_str(), "monitoring thread started");
            }
        }
    }

    /// Stops every registered child.
    pub fn stop(&mut self) -> Result<()> {
        let names = self.order.clone();
        for name in names {
            self.stop_process(&name)?;
        }
        Ok(())
    }

    fn entry(&self, name: &str) -> Result<Arc<ChildEntry>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("process not registered: {name}")))
    }
}

/// Sleeps up to `duration`, waking early and returning as soon as
/// `stop_signal` is set. Every wait the monitor performs (steady-state
/// polling and the restart delay) goes through this so a pending
/// `stop_process` is never held up behind a multi-second wait.
fn interruptible_sleep(duration: Duration, stop_signal: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !stop_signal.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        std::thread::sleep(remaining.min(Duration::from_millis(10)));
    }
}

/// Monitor cadence: while a child is alive, liveness is polled once per
/// second. While a child is being restarted, checks are bounded only by the
/// restart policy's own delay, so a budget of N restarts is exhausted in
/// roughly N * restart_delay rather than N seconds; this matches the crate's
/// own restart-budget test scenarios better than a flat per-iteration sleep
/// would.
fn spawn_monitor(name: String, entry: Arc<ChildEntry>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !entry.stop_signal.load(Ordering::SeqCst) {
            let alive = entry.child.lock().is_alive();
            if !alive {
                info!(child = name.as_str(), "process stopped unexpectedly");
                match restart(&name, &entry) {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => error!(child = name.as_str(), "restart attempt failed: {e}"),
                }
            }
            interruptible_sleep(Duration::from_secs(1), &entry.stop_signal);
        }
    })
}

/// Applies the restart policy once. Returns `Ok(true)` if the child was
/// relaunched, `Ok(false)` if the restart budget is exhausted or a stop was
/// requested while waiting out the restart delay.
///
/// The stop check and the relaunch happen under the same `child` lock that
/// [`Supervisor::stop_process`] takes for its own `child.stop()` call: if a
/// stop is requested after we've already committed to relaunching, the
/// `stop_process` call simply blocks until `launch` finishes and then stops
/// the freshly-launched process, instead of racing past it and leaving an
/// untracked process behind.
fn restart(name: &str, entry: &ChildEntry) -> Result<bool> {
    let now = Monotonic::now();
    let (should_restart, delay) = {
        let mut state = entry.state.lock();
        if now >= state.reset_deadline {
            state.restart_count = 0;
            state.reset_deadline = now + state.policy.reset_window;
        }
        if state.restart_count < state.policy.n_restart {
            (true, state.policy.restart_delay)
        } else {
            (false, Duration::ZERO)
        }
    };

    if !should_restart {
        error!(child = name, "maximum restart limit reached");
        return Ok(false);
    }

    interruptible_sleep(delay, &entry.stop_signal);

    let mut child = entry.child.lock();
    if entry.stop_signal.load(Ordering::SeqCst) {
        info!(child = name, "stop requested during restart delay, skipping relaunch");
        return Ok(false);
    }
    child.launch()?;
    drop(child);

    let mut state = entry.state.lock();
    state.restart_count += 1;
    state.last_restart = Some(Monotonic::now());
    info!(child = name, count = state.restart_count, "restarted");
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::process::ThreadChild;
    use std::sync::atomic::AtomicUsize;

    fn crashing_child(name: &str, launches: Arc<AtomicUsize>) -> Box<dyn ManagedChild> {
        Box::new(ThreadChild::new(name, move |_keep_running| {
            launches.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_restart_budget_is_enforced() {
        let launches = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new();
        let policy = RestartPolicy {
            n_restart: 3,
            restart_delay: Duration::from_millis(10),
            reset_window: Duration::from_secs(60),
        };
        supervisor
            .add_process(crashing_child("flaky", launches.clone()), policy)
            .unwrap();
        supervisor.start_process("flaky").unwrap();
        supervisor.monitor_processes();

        std::thread::sleep(Duration::from_millis(600));

        // one initial launch plus exactly n_restart retries, then the budget is exhausted
        assert_eq!(launches.load(Ordering::SeqCst), 4);

        supervisor.stop().unwrap();
    }

    #[test]
    fn test_restart_count_resets_after_the_reset_window_elapses() {
        let launches = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new();
        let policy = RestartPolicy {
            n_restart: 1,
            restart_delay: Duration::from_millis(10),
            reset_window: Duration::from_millis(150),
        };
        supervisor
            .add_process(crashing_child("flaky", launches.clone()), policy)
            .unwrap();
        supervisor.start_process("flaky").unwrap();
        supervisor.monitor_processes();

        // initial launch plus the single restart the budget allows; by then
        // the budget is exhausted and the monitor falls back to polling
        // once a second.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(launches.load(Ordering::SeqCst), 2);

        // once the reset window has elapsed, the next poll resets
        // restart_count to 0 before deciding, so the still-dead child is
        // allowed one more restart even though the original budget was
        // already spent.
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(launches.load(Ordering::SeqCst), 3);

        supervisor.stop().unwrap();
    }

    #[test]
    fn test_stop_during_pending_restart_leaves_no_process_behind() {
        let launches = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new();
        let policy = RestartPolicy {
            n_restart: 5,
            restart_delay: Duration::from_millis(200),
            reset_window: Duration::from_secs(60),
        };
        supervisor
            .add_process(crashing_child("flaky", launches.clone()), policy)
            .unwrap();
        supervisor.start_process("flaky").unwrap();
        supervisor.monitor_processes();

        // let the child crash and the monitor commit to a restart; it is
        // now inside the 200ms restart_delay wait.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(launches.load(Ordering::SeqCst), 1);

        // stop while the monitor is still waiting out the restart delay.
        // stop_process must win the race: no further launch should happen,
        // and the monitor thread must have terminated by the time this
        // returns.
        supervisor.stop_process("flaky").unwrap();

        // give a racing relaunch every opportunity to happen before asserting it didn't.
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(launches.load(Ordering::SeqCst), 1, "child must not be relaunched after stop");
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let launches = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new();
        supervisor
            .add_process(crashing_child("dup", launches.clone()), RestartPolicy::default())
            .unwrap();
        let err = supervisor
            .add_process(crashing_child("dup", launches), RestartPolicy::default())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_stop_process_removes_it_from_the_registry() {
        let launches = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new();
        supervisor
            .add_process(crashing_child("once", launches), RestartPolicy::default())
            .unwrap();
        supervisor.stop_process("once").unwrap();
        assert!(supervisor.start_process("once").is_err());
    }
}
