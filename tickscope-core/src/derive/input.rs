//! Derivation inputs: one reader task per input metric.

use crate::error::{Error, Result};
use crate::ingest::{finish_remainder, read_lines, FrameAssembler, SourceReader};
use crate::types::{CaptureRecord, Locator, MetricRef};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Answers whether something is still appending to a capture.
pub type WriterProbe = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Messages from input readers to the job loop.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Points {
        input: usize,
        points: Vec<(u64, Option<f64>)>,
    },
    Done {
        input: usize,
    },
    Failed {
        input: usize,
        message: String,
    },
}

/// One input metric and where to read it from.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub index: usize,
    pub metric: MetricRef,
    pub locator: Locator,
}

/// Streams `(tick, value)` points for one metric.
///
/// Reads the source in batches of `batch_lines` lines. Once the end of the
/// available bytes is reached, the reader either finishes (nothing is writing
/// the capture) or sleeps `poll` and reads on from the same offset.
#[derive(Clone)]
pub struct InputReader {
    reader: SourceReader,
    batch_lines: usize,
    poll: Duration,
    probe: WriterProbe,
}

impl InputReader {
    pub fn new(reader: SourceReader, batch_lines: usize, poll: Duration, probe: WriterProbe) -> Self {
        Self {
            reader,
            batch_lines: batch_lines.max(1),
            poll,
            probe,
        }
    }

    /// Spawn the reader; failures are reported as [`InputEvent::Failed`].
    pub fn spawn(
        &self,
        spec: InputSpec,
        cancel: CancellationToken,
        tx: mpsc::Sender<InputEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let input = spec.index;
            match this.run(&spec, &cancel, &tx).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    tracing::debug!(input, metric = %spec.metric, "Input reader cancelled");
                }
                Err(e) => {
                    tracing::warn!(input, metric = %spec.metric, error = %e, "Input reader failed");
                    let _ = tx
                        .send(InputEvent::Failed {
                            input,
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        })
    }

    pub async fn run(
        &self,
        spec: &InputSpec,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<InputEvent>,
    ) -> Result<()> {
        let mut offset = 0u64;
        let mut leftover = Vec::new();
        let mut assembler = FrameAssembler::new();

        loop {
            // Sampled before reading so bytes written after this point are
            // picked up by the next pass.
            let writing = (self.probe)(&spec.metric.capture_id);

            let mut read = self.reader.open_from(&spec.locator, offset).await?;
            if read.truncated {
                tracing::warn!(metric = %spec.metric, offset, "Input source truncated, rereading");
                offset = 0;
                leftover.clear();
                assembler.clear();
                continue;
            }

            loop {
                let mut points = Vec::new();
                let summary = read_lines(
                    &mut read.stream,
                    std::mem::take(&mut leftover),
                    Some(self.batch_lines),
                    cancel,
                    |line| {
                        if let Some(frame) = assembler.push_line(line) {
                            points.push(point(&spec.metric, &frame));
                        }
                    },
                )
                .await?;
                offset += summary.bytes_read;
                leftover = summary.remainder;
                send_points(tx, spec.index, points).await?;
                if !summary.capped {
                    break;
                }
            }

            if !writing {
                let mut points = Vec::new();
                finish_remainder(&leftover, |line| {
                    if let Some(frame) = assembler.push_line(line) {
                        points.push(point(&spec.metric, &frame));
                    }
                });
                if let Some(frame) = assembler.flush() {
                    points.push(point(&spec.metric, &frame));
                }
                send_points(tx, spec.index, points).await?;
                tx.send(InputEvent::Done { input: spec.index })
                    .await
                    .map_err(|_| Error::Cancelled)?;
                tracing::debug!(metric = %spec.metric, bytes = offset, "Input exhausted");
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
    }
}

fn point(metric: &MetricRef, frame: &CaptureRecord) -> (u64, Option<f64>) {
    (frame.tick, metric.extract(frame))
}

async fn send_points(
    tx: &mpsc::Sender<InputEvent>,
    input: usize,
    points: Vec<(u64, Option<f64>)>,
) -> Result<()> {
    if points.is_empty() {
        return Ok(());
    }
    tx.send(InputEvent::Points { input, points })
        .await
        .map_err(|_| Error::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn reader(probe: WriterProbe) -> InputReader {
        let source = SourceReader::new(&IngestConfig::default()).unwrap();
        InputReader::new(source, 2, Duration::from_millis(10), probe)
    }

    async fn collect(mut rx: mpsc::Receiver<InputEvent>) -> Vec<(u64, Option<f64>)> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                InputEvent::Points { points, .. } => out.extend(points),
                InputEvent::Done { .. } => break,
                InputEvent::Failed { message, .. } => panic!("input failed: {}", message),
            }
        }
        out
    }

    #[tokio::test]
    async fn test_reads_batches_and_final_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"tick":1,"entities":{{"e":{{"c":{{"x":1}}}}}}}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, r#"{{"tick":2,"entities":{{"e":{{"c":{{"x":null}}}}}}}}"#).unwrap();
        writeln!(file, r#"{{"tick":3,"entityId":"e","componentId":"c","value":{{"x":2.5}}}}"#).unwrap();
        write!(file, r#"{{"tick":4,"entities":{{"e":{{"c":{{"x":4}}}}}}}}"#).unwrap();
        file.flush().unwrap();

        let spec = InputSpec {
            index: 0,
            metric: MetricRef::new("cap", &["e", "c", "x"]),
            locator: Locator::File(file.path().to_path_buf()),
        };
        let (tx, rx) = mpsc::channel(16);
        reader(Arc::new(|_: &str| false)).spawn(spec, CancellationToken::new(), tx);

        assert_eq!(
            collect(rx).await,
            vec![(1, Some(1.0)), (2, None), (3, Some(2.5)), (4, Some(4.0))]
        );
    }

    #[tokio::test]
    async fn test_follows_until_writer_stops() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"tick":1,"entities":{{"e":{{"c":{{"x":1}}}}}}}}"#).unwrap();
        file.flush().unwrap();

        let writing = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&writing);
        let probe: WriterProbe = Arc::new(move |_: &str| flag.load(Ordering::SeqCst));

        let spec = InputSpec {
            index: 0,
            metric: MetricRef::new("cap", &["e", "c", "x"]),
            locator: Locator::File(file.path().to_path_buf()),
        };
        let (tx, rx) = mpsc::channel(16);
        reader(probe).spawn(spec, CancellationToken::new(), tx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        writeln!(file, r#"{{"tick":2,"entities":{{"e":{{"c":{{"x":2}}}}}}}}"#).unwrap();
        file.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        writing.store(false, Ordering::SeqCst);

        assert_eq!(collect(rx).await, vec![(1, Some(1.0)), (2, Some(2.0))]);
    }

    #[tokio::test]
    async fn test_missing_source_fails() {
        let spec = InputSpec {
            index: 3,
            metric: MetricRef::new("cap", &["e", "c"]),
            locator: Locator::File("/nonexistent/tickscope/input.jsonl".into()),
        };
        let (tx, mut rx) = mpsc::channel(4);
        reader(Arc::new(|_: &str| false)).spawn(spec, CancellationToken::new(), tx);
        assert!(matches!(
            rx.recv().await,
            Some(InputEvent::Failed { input: 3, .. })
        ));
    }
}
