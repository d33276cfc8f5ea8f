use std::sync::atomic::{AtomicUsize, Ordering};

use crate::wire::{AnalyzedBatch, RawEvent};
use crate::{Error, Result};

/// The user-supplied transform at the heart of a worker.
///
/// `n_outputs` is fixed for the lifetime of the pipeline and determines how
/// many senders the pipeline spawns. An analyzer may fail arbitrarily on any
/// call to `run`; failures are not recovered inside the worker, they
/// terminate it and the supervisor decides whether to restart.
pub trait Analyzer: Send + Sync {
    /// The number of outputs this analyzer produces per invocation (`K`).
    fn n_outputs(&self) -> usize;
    /// Transforms one event into a batch of exactly `n_outputs` events.
    fn run(&self, event: RawEvent) -> Result<AnalyzedBatch>;
}

/// Wraps every input in a single-element batch, unchanged.
///
/// `K = 1`. Combined with an identity-preserving serializer, external output
/// equals input byte-for-byte once per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityAnalyzer;

impl Analyzer for IdentityAnalyzer {
    fn n_outputs(&self) -> usize {
        1
    }

    fn run(&self, event: RawEvent) -> Result<AnalyzedBatch> {
        Ok(vec![event])
    }
}

/// Identity analyzer that raises an [`Error::Analyzer`] after a configured
/// number of successful calls, to exercise worker-crash recovery.
#[derive(Debug)]
pub struct CrashAfterAnalyzer {
    crash_after: usize,
    calls: AtomicUsize,
}

impl CrashAfterAnalyzer {
    pub fn new(crash_after: usize) -> Self {
        Self {
            crash_after,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Analyzer for CrashAfterAnalyzer {
    fn n_outputs(&self) -> usize {
        1
    }

    fn run(&self, event: RawEvent) -> Result<AnalyzedBatch> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if calls > self.crash_after {
            return Err(Error::Analyzer(format!(
                "simulated crash after {} calls",
                self.crash_after
            )));
        }
        Ok(vec![event])
    }
}

/// Splits a 2-D image payload into a 1-D projection (output 0) and a scalar
/// sum (output 1). A simplified, loosely-typed stand-in for image-projection
/// analyzers in the reference deployment.
///
/// Expects `event.data` to be a JSON array of JSON arrays of numbers (a
/// row-major matrix).
#[derive(Debug, Default, Clone, Copy)]
pub struct ProjectionAnalyzer;

impl Analyzer for ProjectionAnalyzer {
    fn n_outputs(&self) -> usize {
        2
    }

    fn run(&self, event: RawEvent) -> Result<AnalyzedBatch> {
        let rows = event
            .data
            .as_array()
            .ok_or_else(|| Error::Analyzer("projection input is not a matrix".into()))?;

        let mut column_sums: Vec<f64> = Vec::new();
        let mut total = 0.0_f64;
        for row in rows {
            let row = row
                .as_array()
                .ok_or_else(|| Error::Analyzer("projection row is not an array".into()))?;
            if column_sums.is_empty() {
                column_sums = vec![0.0; row.len()];
            }
            for (idx, value) in row.iter().enumerate() {
                let v = value
                    .as_f64()
                    .ok_or_else(|| Error::Analyzer("projection cell is not numeric".into()))?;
                column_sums[idx] += v;
                total += v;
            }
        }

        let projection = RawEvent {
            data: serde_json::json!(column_sums),
            type_: "SPECTRUM".into(),
            macropulse: event.macropulse,
            name: "Projection".into(),
            timestamp: event.timestamp,
            miscellaneous: event.miscellaneous.clone(),
        };
        let sum = RawEvent {
            data: serde_json::json!(total),
            type_: "FLOAT".into(),
            macropulse: event.macropulse,
            name: "Sum".into(),
            timestamp: event.timestamp,
            miscellaneous: event.miscellaneous,
        };

        Ok(vec![projection, sum])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn sample_event() -> RawEvent {
        RawEvent {
            data: json!(1.0),
            type_: "FLOAT".into(),
            timestamp: 0.0,
            macropulse: 0,
            miscellaneous: json!({}),
            name: "test".into(),
        }
    }

    #[test]
    fn test_identity_analyzer_wraps_input() {
        let event = sample_event();
        let batch = IdentityAnalyzer.run(event.clone()).unwrap();
        assert_eq!(batch, vec![event]);
    }

    #[test]
    fn test_crash_after_analyzer_crashes_on_schedule() {
        let analyzer = CrashAfterAnalyzer::new(2);
        assert!(analyzer.run(sample_event()).is_ok());
        assert!(analyzer.run(sample_event()).is_ok());
        assert!(analyzer.run(sample_event()).is_err());
    }

    #[test]
    fn test_projection_analyzer_produces_two_outputs() {
        let mut event = sample_event();
        event.data = json!([[1.0, 2.0], [3.0, 4.0]]);
        let batch = ProjectionAnalyzer.run(event).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].data, json!([4.0, 6.0]));
        assert_eq!(batch[1].data, json!(10.0));
    }
}
