use crate::error::{PipelineError, PipelineResult};
use crate::io::BundleSender;
use crate::series::{TimeSeriesReader, TimeSeriesRecord};
use crate::utils::CancelToken;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Paced sources further behind than this are reported.
const PACE_LAG_WARN: Duration = Duration::from_millis(50);

/// One subscriber of a source: a bundle sender plus the channel to push into.
pub struct Feed {
    sender: BundleSender<TimeSeriesRecord>,
    channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub name: String,
    pub records: usize,
}

/// Publishes every row of one reader to all of its feeds, then signals one
/// completion per feed.
///
/// A failing source cancels the whole pipeline and signals nothing, so a
/// partially read input never looks like a complete run downstream.
pub struct Source<R = BufReader<File>> {
    name: String,
    reader: TimeSeriesReader<R>,
    feeds: Vec<Feed>,
    cancel: CancelToken,
    pace_realtime: bool,
}

impl<R: BufRead + Send + 'static> Source<R> {
    pub fn new(name: impl Into<String>, reader: TimeSeriesReader<R>, cancel: CancelToken) -> Self {
        Self {
            name: name.into(),
            reader,
            feeds: Vec::new(),
            cancel,
            pace_realtime: false,
        }
    }

    pub fn feed(
        mut self,
        sender: BundleSender<TimeSeriesRecord>,
        channel: impl Into<String>,
    ) -> Self {
        self.feeds.push(Feed {
            sender,
            channel: channel.into(),
        });
        self
    }

    /// Publish no faster than the record timestamps.
    pub fn pace_realtime(mut self, on: bool) -> Self {
        self.pace_realtime = on;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(mut self) -> PipelineResult<SourceReport> {
        // dropped before `self` on unwind, so the run is cancelled before
        // any sender closes
        let guard = self.cancel.guard(format!("source {}", self.name));
        let res = match self.pump() {
            Ok(records) => {
                for feed in &self.feeds {
                    feed.sender.signal_producer_done();
                }
                tracing::info!("[Source] {}: {} records published", self.name, records);
                Ok(SourceReport {
                    name: self.name,
                    records,
                })
            }
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::error!("[Source] {} failed: {}", self.name, e);
                    self.cancel
                        .cancel_because(format!("source {} failed: {e}", self.name));
                }
                Err(e)
            }
        };
        guard.disarm();
        res
    }

    fn pump(&mut self) -> PipelineResult<usize> {
        let started = Instant::now();
        let mut first_time: Option<f64> = None;
        let mut published = 0;

        while self.reader.has_next() {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let record = self.reader.read_next()?;

            if self.pace_realtime {
                let t0 = *first_time.get_or_insert(record.time());
                let due = started + Duration::from_secs_f64((record.time() - t0).max(0.0));
                let now = Instant::now();
                if due > now {
                    if !self.cancel.sleep_cancellable(due - now) {
                        return Err(PipelineError::Cancelled);
                    }
                } else if now - due > PACE_LAG_WARN {
                    crate::warn_throttled!(
                        Duration::from_secs(5),
                        "[Source] {} lags wall clock by {:?} at t={}",
                        self.name,
                        now - due,
                        record.time()
                    );
                }
            }

            if let Some((last, rest)) = self.feeds.split_last() {
                for feed in rest {
                    feed.sender.push(&feed.channel, record.clone())?;
                }
                last.sender.push(&last.channel, record)?;
            }
            published += 1;
        }
        Ok(published)
    }

    /// Runs the source on its own named thread.
    pub fn spawn(self) -> PipelineResult<JoinHandle<PipelineResult<SourceReport>>> {
        let handle = thread::Builder::new()
            .name(format!("nms-src-{}", self.name))
            .spawn(move || self.run())?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ChannelBundle, Popped, WaitPolicy};
    use std::io::Cursor;

    type MemSource = Source<Cursor<Vec<u8>>>;

    fn reader(text: &str) -> TimeSeriesReader<Cursor<Vec<u8>>> {
        TimeSeriesReader::from_reader("mem", Cursor::new(text.as_bytes().to_vec())).unwrap()
    }

    fn bundle(cancel: &CancelToken, obligations: usize) -> ChannelBundle<TimeSeriesRecord> {
        ChannelBundle::builder("inputs")
            .channels(["a", "b"])
            .obligations(obligations)
            .wait_policy(WaitPolicy::new(cancel.clone(), Some(Duration::from_secs(2))))
            .build()
    }

    #[test]
    fn publishes_every_row_to_every_feed_then_signals() {
        let cancel = CancelToken::new_root();
        let mut b = bundle(&cancel, 2);
        let rx = b.receiver(["a", "b"]).unwrap();

        let rows = reader("X 2 Y 3\n\ntime m\n0 1\n1 2\n2 3\n");
        let src: MemSource = Source::new("emg", rows, cancel)
            .feed(b.sender(["a"]).unwrap(), "a")
            .feed(b.sender(["b"]).unwrap(), "b");
        let report = src.run().unwrap();
        assert_eq!(report.records, 3);

        for ch in ["a", "b"] {
            let times: Vec<f64> = std::iter::from_fn(|| rx.pop(ch).unwrap().into_record())
                .map(|r| r.time())
                .collect();
            assert_eq!(times, vec![0.0, 1.0, 2.0]);
        }
        assert!(rx.is_drained());
    }

    #[test]
    fn format_error_cancels_and_withholds_completion() {
        let cancel = CancelToken::new_root();
        let mut b = bundle(&cancel, 1);
        let rx = b.receiver(["a"]).unwrap();

        let rows = reader("X 2 Y 3\n\ntime m\n0 1\n1 x\n");
        let src: MemSource = Source::new("bad", rows, cancel.clone())
            .feed(b.sender(["a"]).unwrap(), "a");
        let err = src.run().unwrap_err();

        assert!(matches!(err, PipelineError::Format { .. }));
        assert!(cancel.is_cancelled());
        assert!(cancel.reason().unwrap().contains("source bad failed"));
        assert!(!rx.is_drained());
        assert!(matches!(rx.pop("a"), Err(PipelineError::Cancelled)));
    }

    #[test]
    fn spawned_source_reports_through_join() {
        let cancel = CancelToken::new_root();
        let mut b = bundle(&cancel, 1);
        let rx = b.receiver(["a"]).unwrap();

        let src: MemSource = Source::new("lengths", reader("X 2 Y 1\n\ntime m\n0.5 7\n"), cancel)
            .feed(b.sender(["a"]).unwrap(), "a");
        let handle = src.spawn().unwrap();

        assert_eq!(rx.pop("a").unwrap().into_record().unwrap().value("m"), Some(7.0));
        assert_eq!(rx.pop("a").unwrap(), Popped::EndOfStream);
        assert_eq!(handle.join().unwrap().unwrap().records, 1);
    }

    #[test]
    fn realtime_pacing_spreads_rows_over_their_timestamps() {
        let cancel = CancelToken::new_root();
        let mut b = bundle(&cancel, 1);
        let _rx = b.receiver(["a"]).unwrap();

        let rows = reader("X 2 Y 2\n\ntime m\n0 1\n0.05 2\n");
        let src: MemSource = Source::new("paced", rows, cancel)
            .feed(b.sender(["a"]).unwrap(), "a")
            .pace_realtime(true);
        let started = Instant::now();
        src.run().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(45));
    }
}
