use std::path::PathBuf;
use std::sync::Arc;

use tracing::error;

use crate::connector::SourceConnector;
use crate::fabric::{ChannelSpec, Fabric, FabricChannel};
use crate::wire::encode_event;
use crate::{logging, Result};

/// The producer child routine: opens its own logging sinks, connects the
/// source once, opens the ingress channel, then loops `get_data` → encode →
/// send.
///
/// Grounded in `ripflow.core.processes.Producer.main_routine`: any error,
/// including a source timeout, ends the loop and the routine returns,
/// leaving the restart decision to the supervisor. Logging is (re-)installed
/// here, after the fork, because the parent's file-appender flusher thread
/// does not survive into this process; see [`logging::init_child`].
pub fn run_producer<F: Fabric>(fabric: F, ingress: ChannelSpec, source: Arc<dyn SourceConnector>, log_file_path: PathBuf, log_level: String) {
    let _logging_guard = match logging::init_child(&log_file_path, &log_level) {
        Ok(guards) => Some(guards),
        Err(e) => {
            eprintln!("producer: failed to install child logger: {e}");
            None
        }
    };
    if let Err(e) = try_run_producer(fabric, ingress, source) {
        error!("producer exiting: {e}");
    }
}

fn try_run_producer<F: Fabric>(fabric: F, ingress: ChannelSpec, source: Arc<dyn SourceConnector>) -> Result<()> {
    let ctx = fabric.create_context()?;
    source.connect()?;
    let mut channel = fabric.create_channel(&ctx, &ingress)?;
    loop {
        let event = source.get_data()?;
        let bytes = encode_event(&event)?;
        channel.send(bytes)?;
    }
}
