use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Aggregated losses for one epoch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f32,
    pub valid_loss: f32,
}

/// Receiver for training telemetry. The trainer emits one batch event per
/// optimisation step, keyed by a step counter that increases monotonically
/// across the whole run, and one epoch event after validation.
pub trait MetricSink {
    fn record_batch(&mut self, _step: usize, _loss: f32) {}
    fn record_epoch(&mut self, _stats: &EpochStats) {}
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl MetricSink for NullSink {}

/// Routes events into the `tracing` pipeline: batch losses at debug level,
/// epoch summaries at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record_batch(&mut self, step: usize, loss: f32) {
        tracing::debug!(step, loss, "train batch");
    }

    fn record_epoch(&mut self, stats: &EpochStats) {
        tracing::info!(
            epoch = stats.epoch,
            train_loss = stats.train_loss,
            valid_loss = stats.valid_loss,
            "epoch complete"
        );
    }
}

/// Writes one tab-separated `epoch  train  valid` line per epoch.
pub struct TsvSink<W: Write> {
    writer: W,
}

impl TsvSink<BufWriter<File>> {
    /// Creates a sink appending to a file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }
}

impl<W: Write> TsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> MetricSink for TsvSink<W> {
    fn record_epoch(&mut self, stats: &EpochStats) {
        let line = format!(
            "{}\t{:.4}\t{:.4}\n",
            stats.epoch, stats.train_loss, stats.valid_loss
        );
        if let Err(error) = self.writer.write_all(line.as_bytes()) {
            tracing::warn!(%error, "failed to write epoch stats");
        }
        if let Err(error) = self.writer.flush() {
            tracing::warn!(%error, "failed to flush epoch stats");
        }
    }
}

/// Fans events out to a pair of sinks.
pub struct TeeSink<A: MetricSink, B: MetricSink> {
    first: A,
    second: B,
}

impl<A: MetricSink, B: MetricSink> TeeSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: MetricSink, B: MetricSink> MetricSink for TeeSink<A, B> {
    fn record_batch(&mut self, step: usize, loss: f32) {
        self.first.record_batch(step, loss);
        self.second.record_batch(step, loss);
    }

    fn record_epoch(&mut self, stats: &EpochStats) {
        self.first.record_epoch(stats);
        self.second.record_epoch(stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsv_sink_formats_epoch_lines() {
        let mut buffer = Vec::new();
        {
            let mut sink = TsvSink::new(&mut buffer);
            sink.record_epoch(&EpochStats {
                epoch: 3,
                train_loss: 0.1234,
                valid_loss: 0.5,
            });
        }
        assert_eq!(String::from_utf8(buffer).unwrap(), "3\t0.1234\t0.5000\n");
    }

    #[test]
    fn tee_sink_duplicates_events() {
        struct Counter(usize);
        impl MetricSink for Counter {
            fn record_batch(&mut self, _step: usize, _loss: f32) {
                self.0 += 1;
            }
        }
        let mut tee = TeeSink::new(Counter(0), Counter(0));
        tee.record_batch(0, 1.0);
        tee.record_batch(1, 1.0);
        assert_eq!(tee.first.0, 2);
        assert_eq!(tee.second.0, 2);
    }
}
