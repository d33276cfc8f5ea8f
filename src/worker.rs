use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use crate::analyzer::Analyzer;
use crate::connector::SinkConnector;
use crate::fabric::{ChannelSpec, Fabric, FabricChannel};
use crate::wire::decode_event;
use crate::{logging, Error, Result};

/// The worker child routine: opens its own logging sinks, opens one ingress
/// channel and `K` egress channels, then loops decode → analyze → serialize
/// → send, one egress channel per analyzer output, bound by position.
///
/// Grounded in `ripflow.core.processes.Worker.main_routine`. Logging is
/// (re-)installed here, after the fork, for the same reason as the producer;
/// see [`logging::init_child`].
#[allow(clippy::too_many_arguments)]
pub fn run_worker<F: Fabric>(
    fabric: F,
    ingress: ChannelSpec,
    egress: Vec<ChannelSpec>,
    analyzer: Arc<dyn Analyzer>,
    sink: Arc<dyn SinkConnector>,
    worker_id: usize,
    log_file_path: PathBuf,
    log_level: String,
) {
    let _logging_guard = match logging::init_child(&log_file_path, &log_level) {
        Ok(guards) => Some(guards),
        Err(e) => {
            eprintln!("worker-{worker_id}: failed to install child logger: {e}");
            None
        }
    };
    if let Err(e) = try_run_worker(fabric, ingress, egress, analyzer, sink, worker_id) {
        error!(worker_id, "worker exiting: {e}");
    }
}

fn try_run_worker<F: Fabric>(
    fabric: F,
    ingress: ChannelSpec,
    egress: Vec<ChannelSpec>,
    analyzer: Arc<dyn Analyzer>,
    sink: Arc<dyn SinkConnector>,
    worker_id: usize,
) -> Result<()> {
    let ctx = fabric.create_context()?;
    let mut input = fabric.create_channel(&ctx, &ingress)?;
    let mut outputs = egress
        .iter()
        .map(|spec| fabric.create_channel(&ctx, spec))
        .collect::<Result<Vec<_>>>()?;
    info!(worker_id, "worker launched");

    loop {
        let bytes = input.recv()?;
        let event = decode_event(&bytes)?;
        let batch = analyzer.run(event)?;
        if batch.len() != outputs.len() {
            return Err(Error::Analyzer(format!(
                "analyzer produced {} outputs, expected {}",
                batch.len(),
                outputs.len()
            )));
        }
        for (output, item) in outputs.iter_mut().zip(batch.into_iter()) {
            let frame = sink.serializer().serialize(&item)?;
            output.send(frame)?;
        }
    }
}
