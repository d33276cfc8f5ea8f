use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_appender::non_blocking::WorkerGuard;

use crate::analyzer::Analyzer;
use crate::connector::{SinkConnector, SourceConnector};
use crate::fabric::{ChannelRole, ChannelSpec, ZmqFabric};
use crate::process::ProcessChild;
use crate::supervisor::{RestartPolicy, Supervisor};
use crate::{logging, producer, sender, worker, Error, Result};

const SOURCE_ADDRESS: &str = "ipc://source";
const SENDER_ADDRESS: &str = "ipc://sender";

/// Builds a [`Ripflow`] pipeline from its four required collaborators plus
/// optional overrides.
///
/// Mirrors the reference deployment's `Ripflow.__init__` constructor
/// options one-to-one (`n_workers` default 2, `log_file_path` default
/// `server.log`, `log_level` default `INFO`).
pub struct RipflowBuilder {
    source_connector: Option<Arc<dyn SourceConnector>>,
    sink_connector: Option<Arc<dyn SinkConnector>>,
    analyzer: Option<Arc<dyn Analyzer>>,
    n_workers: usize,
    log_file_path: PathBuf,
    log_level: String,
    restart_policy: RestartPolicy,
}

impl Default for RipflowBuilder {
    fn default() -> Self {
        Self {
            source_connector: None,
            sink_connector: None,
            analyzer: None,
            n_workers: 2,
            log_file_path: PathBuf::from("server.log"),
            log_level: "INFO".to_string(),
            restart_policy: RestartPolicy::default(),
        }
    }
}

impl RipflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_connector(mut self, source_connector: Arc<dyn SourceConnector>) -> Self {
        self.source_connector = Some(source_connector);
        self
    }

    pub fn sink_connector(mut self, sink_connector: Arc<dyn SinkConnector>) -> Self {
        self.sink_connector = Some(sink_connector);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn n_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers;
        self
    }

    pub fn log_file_path(mut self, log_file_path: impl Into<PathBuf>) -> Self {
        self.log_file_path = log_file_path.into();
        self
    }

    pub fn log_level(mut self, log_level: impl Into<String>) -> Self {
        self.log_level = log_level.into();
        self
    }

    pub fn restart_policy(mut self, restart_policy: RestartPolicy) -> Self {
        self.restart_policy = restart_policy;
        self
    }

    /// Validates the configuration and wires producer, workers, and senders
    /// into a supervisor, addressed exactly as the reference deployment
    /// does: `ipc://source` for the ingress channel, `ipc://sender_<k>` for
    /// egress channel `k`.
    ///
    /// A zero-output analyzer and a zero-worker pool are both rejected here:
    /// neither can ever produce an observable effect, so both are treated as
    /// configuration errors rather than silently running no-op pipelines.
    ///
    /// Installs the dual stdout+file logger for this (parent) process, and
    /// passes the same log file path and level down to every child so each
    /// one can install its own after the fork (see
    /// [`crate::logging::init_child`]).
    pub fn build(self) -> Result<Ripflow> {
        let source = self
            .source_connector
            .ok_or_else(|| Error::Config("source connector is required".into()))?;
        let sink = self
            .sink_connector
            .ok_or_else(|| Error::Config("sink connector is required".into()))?;
        let analyzer = self
            .analyzer
            .ok_or_else(|| Error::Config("analyzer is required".into()))?;

        let n_senders = analyzer.n_outputs();
        if n_senders == 0 {
            return Err(Error::Config("analyzer must declare at least one output".into()));
        }
        if self.n_workers == 0 {
            return Err(Error::Config("n_workers must be at least 1".into()));
        }

        let log_guard = logging::init(&self.log_file_path, &self.log_level)?;

        let fabric = ZmqFabric;
        let mut supervisor = Supervisor::new();

        {
            let fabric = fabric;
            let source = source.clone();
            let ingress = ChannelSpec::new(ChannelRole::PushBind, SOURCE_ADDRESS);
            let log_file_path = self.log_file_path.clone();
            let log_level = self.log_level.clone();
            supervisor.add_process(
                Box::new(ProcessChild::new("producer", move || {
                    producer::run_producer(fabric, ingress.clone(), source.clone(), log_file_path.clone(), log_level.clone());
                })),
                self.restart_policy,
            )?;
        }

        for worker_id in 0..self.n_workers {
            let fabric = fabric;
            let analyzer = analyzer.clone();
            let sink = sink.clone();
            let ingress = ChannelSpec::new(ChannelRole::PullConnect, SOURCE_ADDRESS);
            let egress: Vec<ChannelSpec> = (0..n_senders)
                .map(|idx| ChannelSpec::new(ChannelRole::PushConnect, format!("{SENDER_ADDRESS}_{idx}")))
                .collect();
            let log_file_path = self.log_file_path.clone();
            let log_level = self.log_level.clone();
            supervisor.add_process(
                Box::new(ProcessChild::new(format!("worker-{worker_id}"), move || {
                    worker::run_worker(
                        fabric,
                        ingress.clone(),
                        egress.clone(),
                        analyzer.clone(),
                        sink.clone(),
                        worker_id,
                        log_file_path.clone(),
                        log_level.clone(),
                    );
                })),
                self.restart_policy,
            )?;
        }

        for idx in 0..n_senders {
            let fabric = fabric;
            let sink = sink.clone();
            let egress = ChannelSpec::new(ChannelRole::PullBind, format!("{SENDER_ADDRESS}_{idx}"));
            let log_file_path = self.log_file_path.clone();
            let log_level = self.log_level.clone();
            supervisor.add_process(
                Box::new(ProcessChild::new(format!("sender-{idx}"), move || {
                    sender::run_sender(fabric, egress.clone(), idx, sink.clone(), log_file_path.clone(), log_level.clone());
                })),
                self.restart_policy,
            )?;
        }

        Ok(Ripflow { supervisor, _log_guard: log_guard })
    }
}

/// The running pipeline: producer, workers, and senders registered with a
/// supervisor, plus the log appender guard that keeps buffered log lines
/// alive for the pipeline's lifetime.
pub struct Ripflow {
    supervisor: Supervisor,
    _log_guard: WorkerGuard,
}

impl Ripflow {
    /// Starts every child in registration order and begins supervising
    /// them. If `background` is false, blocks the calling thread until
    /// [`Ripflow::stop`] is called from another thread.
    pub fn event_loop(&self, background: bool) -> Result<()> {
        self.supervisor.start_all_processes(Duration::ZERO)?;
        self.supervisor.monitor_processes();
        if !background {
            loop {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        Ok(())
    }

    /// Stops every child and their monitoring threads.
    pub fn stop(&mut self) -> Result<()> {
        self.supervisor.stop()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analyzer::{Analyzer, CrashAfterAnalyzer, IdentityAnalyzer, ProjectionAnalyzer};
    use crate::connector::{SequenceSourceConnector, SourceConnector};
    use crate::fabric::LoopbackFabric;
    use crate::process::ThreadChild;
    use crate::serializer::{JsonSerializer, Serializer};
    use crate::wire::RawEvent;
    use crate::Result as CrateResult;
    use serde_json::json;

    /// A [`SinkConnector`] double that records every published frame instead
    /// of publishing over a real socket, so these tests can assert on what
    /// a subscriber would have received.
    struct RecordingSink {
        serializer: JsonSerializer,
        received: crate::locking::Mutex<Vec<(usize, Vec<u8>)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                serializer: JsonSerializer,
                received: crate::locking::Mutex::new(Vec::new()),
            })
        }

        fn macropulses(&self) -> Vec<i64> {
            self.received
                .lock()
                .iter()
                .map(|(_, bytes)| {
                    let value: serde_json::Value = serde_json::from_slice(bytes).unwrap();
                    value["macropulse"].as_i64().unwrap()
                })
                .collect()
        }
    }

    impl SinkConnector for RecordingSink {
        fn serializer(&self) -> &dyn Serializer {
            &self.serializer
        }

        fn connect_subprocess(&self, _idx: usize) -> CrateResult<()> {
            Ok(())
        }

        fn send(&self, idx: usize, frame: &[u8]) -> CrateResult<()> {
            self.received.lock().push((idx, frame.to_vec()));
            Ok(())
        }
    }

    fn event(macropulse: i64) -> RawEvent {
        RawEvent {
            data: json!(macropulse as f64),
            type_: "FLOAT".into(),
            timestamp: macropulse as f64,
            macropulse,
            miscellaneous: json!({}),
            name: "test".into(),
        }
    }

    /// Wires a producer, `n_workers` workers, and one sender per analyzer
    /// output over a [`LoopbackFabric`], each running on a [`ThreadChild`]
    /// instead of a forked process, registered with a tight restart policy.
    fn spawn_chain(
        source: Arc<dyn SourceConnector>,
        analyzer: Arc<dyn Analyzer>,
        sink: Arc<RecordingSink>,
        n_workers: usize,
    ) -> Supervisor {
        let fabric = LoopbackFabric::new();
        let n_senders = analyzer.n_outputs();
        let policy = RestartPolicy {
            n_restart: 3,
            restart_delay: Duration::from_millis(10),
            reset_window: Duration::from_secs(60),
        };
        // Each `ThreadChild` here shares this test process, not a fresh one,
        // so `logging::init_child` installs a thread-local subscriber per
        // thread rather than racing to set the process global.
        let log_file_path = std::env::temp_dir().join("ripflow_pipeline_test.log");
        let log_level = "INFO".to_string();
        let mut supervisor = Supervisor::new();

        {
            let fabric = fabric.clone();
            let source = source.clone();
            let ingress = ChannelSpec::new(ChannelRole::PushBind, "loopback://source");
            let log_file_path = log_file_path.clone();
            let log_level = log_level.clone();
            supervisor
                .add_process(
                    Box::new(ThreadChild::new("producer", move |_keep_running| {
                        producer::run_producer(fabric.clone(), ingress.clone(), source.clone(), log_file_path.clone(), log_level.clone());
                    })),
                    policy,
                )
                .unwrap();
        }

        for worker_id in 0..n_workers {
            let fabric = fabric.clone();
            let analyzer = analyzer.clone();
            let sink: Arc<dyn SinkConnector> = sink.clone();
            let ingress = ChannelSpec::new(ChannelRole::PullConnect, "loopback://source");
            let egress: Vec<ChannelSpec> = (0..n_senders)
                .map(|idx| ChannelSpec::new(ChannelRole::PushConnect, format!("loopback://sender_{idx}")))
                .collect();
            let log_file_path = log_file_path.clone();
            let log_level = log_level.clone();
            supervisor
                .add_process(
                    Box::new(ThreadChild::new(format!("worker-{worker_id}"), move |_keep_running| {
                        worker::run_worker(
                            fabric.clone(),
                            ingress.clone(),
                            egress.clone(),
                            analyzer.clone(),
                            sink.clone(),
                            worker_id,
                            log_file_path.clone(),
                            log_level.clone(),
                        );
                    })),
                    policy,
                )
                .unwrap();
        }

        for idx in 0..n_senders {
            let fabric = fabric.clone();
            let sink: Arc<dyn SinkConnector> = sink.clone();
            let egress = ChannelSpec::new(ChannelRole::PullBind, format!("loopback://sender_{idx}"));
            let log_file_path = log_file_path.clone();
            let log_level = log_level.clone();
            supervisor
                .add_process(
                    Box::new(ThreadChild::new(format!("sender-{idx}"), move |_keep_running| {
                        sender::run_sender(fabric.clone(), egress.clone(), idx, sink.clone(), log_file_path.clone(), log_level.clone());
                    })),
                    policy,
                )
                .unwrap();
        }

        supervisor
    }

    #[test]
    fn test_happy_path_preserves_order_with_one_worker() {
        let events: Vec<RawEvent> = (0..10).map(event).collect();
        let source = Arc::new(SequenceSourceConnector::with_delay(events, Duration::from_millis(2)));
        let sink = RecordingSink::new();

        let supervisor = spawn_chain(source, Arc::new(IdentityAnalyzer), sink.clone(), 1);
        supervisor.start_all_processes(Duration::ZERO).unwrap();

        std::thread::sleep(Duration::from_millis(300));

        assert_eq!(sink.macropulses(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_crash_recovery_still_delivers_post_crash_events() {
        let events: Vec<RawEvent> = (0..10).map(event).collect();
        let source = Arc::new(SequenceSourceConnector::with_delay(events, Duration::from_millis(5)));
        let sink = RecordingSink::new();

        let supervisor = spawn_chain(source, Arc::new(CrashAfterAnalyzer::new(5)), sink.clone(), 1);
        supervisor.start_all_processes(Duration::ZERO).unwrap();
        supervisor.monitor_processes();

        // the monitor polls a live child once a second, so the first crash
        // is only noticed on its next poll; give it comfortable room past
        // that before asserting.
        std::thread::sleep(Duration::from_millis(1500));

        let max_macropulse = sink.macropulses().into_iter().max();
        assert!(
            max_macropulse.is_some_and(|m| m > 5),
            "expected at least one event past the crash point, got {max_macropulse:?}"
        );
    }

    #[test]
    fn test_multi_output_fan_out_delivers_one_frame_per_sender() {
        let mut image = event(0);
        image.data = json!([[1.0, 2.0], [3.0, 4.0]]);
        let source = Arc::new(SequenceSourceConnector::with_delay(vec![image], Duration::from_millis(2)));
        let sink = RecordingSink::new();

        let supervisor = spawn_chain(source, Arc::new(ProjectionAnalyzer), sink.clone(), 1);
        supervisor.start_all_processes(Duration::ZERO).unwrap();

        std::thread::sleep(Duration::from_millis(200));

        let mut indices: Vec<usize> = sink.received.lock().iter().map(|(idx, _)| *idx).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1]);
    }
}
