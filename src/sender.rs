use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use crate::connector::SinkConnector;
use crate::fabric::{ChannelSpec, Fabric, FabricChannel};
use crate::{logging, Result};

/// The sender child routine: opens its own logging sinks, binds the egress
/// channel, connects the sink's external output exactly once, then loops
/// receive → publish.
///
/// Grounded in `ripflow.core.processes.Sender.main_routine`. Logging is
/// (re-)installed here, after the fork, for the same reason as the
/// producer; see [`logging::init_child`].
pub fn run_sender<F: Fabric>(fabric: F, egress: ChannelSpec, idx: usize, sink: Arc<dyn SinkConnector>, log_file_path: PathBuf, log_level: String) {
    let _logging_guard = match logging::init_child(&log_file_path, &log_level) {
        Ok(guards) => Some(guards),
        Err(e) => {
            eprintln!("sender-{idx}: failed to install child logger: {e}");
            None
        }
    };
    if let Err(e) = try_run_sender(fabric, egress, idx, sink) {
        error!(idx, "sender exiting: {e}");
    }
}

fn try_run_sender<F: Fabric>(fabric: F, egress: ChannelSpec, idx: usize, sink: Arc<dyn SinkConnector>) -> Result<()> {
    let ctx = fabric.create_context()?;
    let mut input = fabric.create_channel(&ctx, &egress)?;
    sink.connect_subprocess(idx)?;
    info!(idx, "sender launched");

    loop {
        let frame = input.recv()?;
        sink.send(idx, &frame)?;
    }
}
