use crate::error::{PipelineError, PipelineResult, SendFailReason, TryRecvError};
use crate::io::channel::{ChannelReceiver, ChannelSender, RecordChannel};
use crate::utils::{CancelToken, CountingGate};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a pop waits on an empty channel before re-checking the gate.
const POP_TICK: Duration = Duration::from_millis(1);

/// Result of a pop: a record, or the end of a fully drained channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Popped<T> {
    Record(T),
    EndOfStream,
}

impl<T> Popped<T> {
    pub fn into_record(self) -> Option<T> {
        match self {
            Popped::Record(r) => Some(r),
            Popped::EndOfStream => None,
        }
    }
}

/// Cancellation and stall detection applied to every blocking push and pop.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    pub cancel: CancelToken,
    pub stall_timeout: Option<Duration>,
}

impl WaitPolicy {
    pub fn new(cancel: CancelToken, stall_timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            stall_timeout,
        }
    }
}

struct BundleShared {
    name: String,
    gate: CountingGate,
    obligations: usize,
}

impl BundleShared {
    /// Every producer obligation has been signalled.
    #[inline]
    fn is_drained(&self) -> bool {
        self.gate.available() >= self.obligations
    }
}

/// Named channels sharing one completion gate.
///
/// The gate starts with zero permits and a target equal to the number of
/// producer-to-subscriber obligations; each obligation releases once, and
/// the bundle is drained when the permit count reaches the target. A source
/// feeding two subscribers therefore owes two signals.
///
/// Sender and receiver halves are handed out as [`BundleSender`] and
/// [`BundleReceiver`]; each channel has exactly one receiver.
pub struct ChannelBundle<T> {
    shared: Arc<BundleShared>,
    senders: BTreeMap<String, ChannelSender<T>>,
    receivers: BTreeMap<String, ChannelReceiver<T>>,
    policy: WaitPolicy,
}

pub struct ChannelBundleBuilder<T> {
    name: String,
    channels: Vec<String>,
    obligations: usize,
    capacity: Option<usize>,
    policy: Option<WaitPolicy>,
    _record: PhantomData<T>,
}

impl<T: Send + 'static> ChannelBundleBuilder<T> {
    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channels.push(name.into());
        self
    }

    pub fn channels<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.channels.extend(names.into_iter().map(Into::into));
        self
    }

    /// Number of completion signals that must arrive before the bundle drains.
    pub fn obligations(mut self, n: usize) -> Self {
        self.obligations = n;
        self
    }

    /// Bounds every channel; pushes block while a channel is full.
    pub fn capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> ChannelBundle<T> {
        let mut senders = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for name in self.channels {
            let (tx, rx) = RecordChannel::with_capacity::<T>(self.capacity);
            senders.insert(name.clone(), tx);
            receivers.insert(name, rx);
        }

        ChannelBundle {
            shared: Arc::new(BundleShared {
                name: self.name,
                gate: CountingGate::new(0),
                obligations: self.obligations,
            }),
            senders,
            receivers,
            policy: self
                .policy
                .unwrap_or_else(|| WaitPolicy::new(CancelToken::new_root(), None)),
        }
    }
}

impl<T: Send + 'static> ChannelBundle<T> {
    pub fn builder(name: impl Into<String>) -> ChannelBundleBuilder<T> {
        ChannelBundleBuilder {
            name: name.into(),
            channels: Vec::new(),
            obligations: 1,
            capacity: None,
            policy: None,
            _record: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.senders.keys().map(String::as_str)
    }

    pub fn obligations(&self) -> usize {
        self.shared.obligations
    }

    /// Sender half restricted to `channels`. May be called once per producer.
    pub fn sender<S: AsRef<str>>(
        &self,
        channels: impl IntoIterator<Item = S>,
    ) -> PipelineResult<BundleSender<T>> {
        let mut out = BTreeMap::new();
        for ch in channels {
            let ch = ch.as_ref();
            let tx = self
                .senders
                .get(ch)
                .ok_or_else(|| self.unknown(ch))?
                .clone();
            out.insert(ch.to_string(), tx);
        }
        Ok(BundleSender {
            shared: self.shared.clone(),
            senders: out,
            policy: self.policy.clone(),
        })
    }

    /// Receiver half for `channels`. Each channel can be taken once.
    pub fn receiver<S: AsRef<str>>(
        &mut self,
        channels: impl IntoIterator<Item = S>,
    ) -> PipelineResult<BundleReceiver<T>> {
        let mut out = BTreeMap::new();
        for ch in channels {
            let ch = ch.as_ref();
            let rx = self.receivers.remove(ch).ok_or_else(|| self.unknown(ch))?;
            out.insert(ch.to_string(), rx);
        }
        Ok(BundleReceiver {
            shared: self.shared.clone(),
            receivers: out,
            policy: self.policy.clone(),
        })
    }

    fn unknown(&self, channel: &str) -> PipelineError {
        PipelineError::UnknownChannel {
            bundle: self.shared.name.clone(),
            channel: channel.to_string(),
        }
    }
}

/// Producer half of a bundle.
pub struct BundleSender<T> {
    shared: Arc<BundleShared>,
    senders: BTreeMap<String, ChannelSender<T>>,
    policy: WaitPolicy,
}

impl<T> Clone for BundleSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            senders: self.senders.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<T: Send + 'static> BundleSender<T> {
    pub fn bundle_name(&self) -> &str {
        &self.shared.name
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.senders.keys().map(String::as_str)
    }

    /// Appends `record` to `channel`, blocking while a bounded channel is full.
    pub fn push(&self, channel: &str, record: T) -> PipelineResult<()> {
        let tx = self.senders.get(channel).ok_or_else(|| PipelineError::UnknownChannel {
            bundle: self.shared.name.clone(),
            channel: channel.to_string(),
        })?;

        if tx.is_full() {
            crate::debug_throttled!(
                Duration::from_secs(5),
                "[Bundle] {}/{} is full, producer waiting",
                self.shared.name,
                channel
            );
        }

        tx.send(record, &self.policy.cancel, self.policy.stall_timeout)
            .map_err(|e| match e.reason {
                SendFailReason::Cancelled => PipelineError::Cancelled,
                SendFailReason::Timeout => PipelineError::Stalled {
                    bundle: self.shared.name.clone(),
                    channel: channel.to_string(),
                    waited: self.policy.stall_timeout.unwrap_or_default(),
                },
                // receivers drop once a cancelled stage exits
                SendFailReason::Closed if self.policy.cancel.is_cancelled() => {
                    PipelineError::Cancelled
                }
                SendFailReason::Closed => PipelineError::Closed {
                    bundle: self.shared.name.clone(),
                    channel: channel.to_string(),
                },
            })
    }

    /// Signals one completion obligation to the bundle gate.
    pub fn signal_producer_done(&self) {
        self.shared.gate.release();
        tracing::trace!(
            "[Bundle] {} completion {}/{}",
            self.shared.name,
            self.shared.gate.available(),
            self.shared.obligations
        );
    }
}

/// Consumer half of a bundle.
pub struct BundleReceiver<T> {
    shared: Arc<BundleShared>,
    receivers: BTreeMap<String, ChannelReceiver<T>>,
    policy: WaitPolicy,
}

impl<T: Send + 'static> BundleReceiver<T> {
    pub fn bundle_name(&self) -> &str {
        &self.shared.name
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.receivers.keys().map(String::as_str)
    }

    pub fn is_drained(&self) -> bool {
        self.shared.is_drained()
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.policy.stall_timeout
    }

    /// Non-blocking [`pop`](Self::pop): `Ok(None)` while `channel` is empty
    /// and producers still owe completion signals.
    pub fn try_pop(&self, channel: &str) -> PipelineResult<Option<Popped<T>>> {
        let rx = self.receivers.get(channel).ok_or_else(|| PipelineError::UnknownChannel {
            bundle: self.shared.name.clone(),
            channel: channel.to_string(),
        })?;
        if self.policy.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        match rx.try_recv() {
            Ok(v) => return Ok(Some(Popped::Record(v))),
            Err(TryRecvError::Disconnected) => return self.closed_end().map(Some),
            Err(TryRecvError::Empty) => {}
        }
        if !self.shared.is_drained() {
            return Ok(None);
        }
        Ok(Some(match rx.try_recv() {
            Ok(v) => Popped::Record(v),
            Err(_) => Popped::EndOfStream,
        }))
    }

    /// An empty channel whose senders are all dropped can never receive
    /// again, so it ends even while other obligations are outstanding.
    /// Failing producers cancel before they drop, which is checked first.
    fn closed_end(&self) -> PipelineResult<Popped<T>> {
        if self.policy.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(Popped::EndOfStream)
    }

    /// Removes the oldest record of `channel`, blocking while the channel is
    /// empty. Returns [`Popped::EndOfStream`] once the channel is empty and
    /// every obligation of the bundle has been signalled, or once every
    /// sender of the channel is gone.
    pub fn pop(&self, channel: &str) -> PipelineResult<Popped<T>> {
        let rx = self.receivers.get(channel).ok_or_else(|| PipelineError::UnknownChannel {
            bundle: self.shared.name.clone(),
            channel: channel.to_string(),
        })?;

        let start = Instant::now();
        loop {
            if self.policy.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            match rx.recv_for(POP_TICK) {
                Ok(v) => return Ok(Popped::Record(v)),
                Err(e) => {
                    if self.shared.is_drained() {
                        // producers push before they signal, so nothing is still in flight
                        return Ok(match rx.try_recv() {
                            Ok(v) => Popped::Record(v),
                            Err(_) => Popped::EndOfStream,
                        });
                    }
                    if e == TryRecvError::Disconnected {
                        return self.closed_end();
                    }
                }
            }

            if let Some(limit) = self.policy.stall_timeout
                && start.elapsed() >= limit
            {
                return Err(PipelineError::Stalled {
                    bundle: self.shared.name.clone(),
                    channel: channel.to_string(),
                    waited: start.elapsed(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn bundle(channels: &[&str], obligations: usize) -> ChannelBundle<u32> {
        ChannelBundle::builder("test")
            .channels(channels.iter().copied())
            .obligations(obligations)
            .build()
    }

    #[test]
    fn fifo_then_end_of_stream() {
        let mut b = bundle(&["a"], 1);
        let tx = b.sender(["a"]).unwrap();
        let rx = b.receiver(["a"]).unwrap();

        for i in 0..5 {
            tx.push("a", i).unwrap();
        }
        tx.signal_producer_done();

        let got: Vec<u32> = (0..5)
            .map(|_| rx.pop("a").unwrap().into_record().unwrap())
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(rx.pop("a").unwrap(), Popped::EndOfStream);
        assert_eq!(rx.pop("a").unwrap(), Popped::EndOfStream);
    }

    #[test]
    fn empty_channel_blocks_until_every_obligation_is_signalled() {
        let mut b = bundle(&["emg", "lmt"], 2);
        let emg = b.sender(["emg"]).unwrap();
        let lmt = b.sender(["lmt"]).unwrap();
        let rx = b.receiver(["emg", "lmt"]).unwrap();

        emg.signal_producer_done();
        assert!(!rx.is_drained());

        let consumer = thread::spawn(move || rx.pop("emg").unwrap());
        thread::sleep(Duration::from_millis(20));
        assert!(!consumer.is_finished());

        lmt.push("lmt", 1).unwrap();
        lmt.signal_producer_done();
        assert_eq!(consumer.join().unwrap(), Popped::EndOfStream);
    }

    #[test]
    fn try_pop_never_blocks() {
        let mut b = bundle(&["a"], 1);
        let tx = b.sender(["a"]).unwrap();
        let rx = b.receiver(["a"]).unwrap();

        assert_eq!(rx.try_pop("a").unwrap(), None);
        tx.push("a", 9).unwrap();
        assert_eq!(rx.try_pop("a").unwrap(), Some(Popped::Record(9)));
        tx.signal_producer_done();
        assert_eq!(rx.try_pop("a").unwrap(), Some(Popped::EndOfStream));
    }

    #[test]
    fn channel_ends_once_its_senders_are_dropped() {
        let mut b = bundle(&["short", "long"], 2);
        let short = b.sender(["short"]).unwrap();
        let long = b.sender(["long"]).unwrap();
        let rx = b.receiver(["short", "long"]).unwrap();
        drop(b);

        short.push("short", 1).unwrap();
        short.signal_producer_done();
        drop(short);

        assert_eq!(rx.pop("short").unwrap(), Popped::Record(1));
        assert_eq!(rx.pop("short").unwrap(), Popped::EndOfStream);
        assert_eq!(rx.try_pop("short").unwrap(), Some(Popped::EndOfStream));
        assert!(!rx.is_drained());
        assert_eq!(rx.try_pop("long").unwrap(), None);
        drop(long);
    }

    #[test]
    fn fan_out_counts_obligations_not_threads() {
        let mut b = bundle(&["eval", "echo"], 2);
        let tx = b.sender(["eval", "echo"]).unwrap();
        let rx = b.receiver(["eval", "echo"]).unwrap();

        tx.push("eval", 1).unwrap();
        tx.push("echo", 1).unwrap();
        tx.signal_producer_done();
        assert!(!rx.is_drained());
        tx.signal_producer_done();
        assert!(rx.is_drained());

        assert_eq!(rx.pop("eval").unwrap(), Popped::Record(1));
        assert_eq!(rx.pop("echo").unwrap(), Popped::Record(1));
        assert_eq!(rx.pop("echo").unwrap(), Popped::EndOfStream);
    }

    #[test]
    fn records_pushed_before_signal_are_never_lost() {
        let mut b = bundle(&["a"], 1);
        let tx = b.sender(["a"]).unwrap();
        let rx = b.receiver(["a"]).unwrap();

        let producer = thread::spawn(move || {
            for i in 0..1000 {
                tx.push("a", i).unwrap();
            }
            tx.signal_producer_done();
        });

        let mut seen = 0;
        while let Popped::Record(v) = rx.pop("a").unwrap() {
            assert_eq!(v, seen);
            seen += 1;
        }
        producer.join().unwrap();
        assert_eq!(seen, 1000);
    }

    /// Records are moved through the bundle, never cloned.
    #[derive(Debug, PartialEq)]
    struct Frame(Vec<f64>);

    #[test]
    fn bundles_carry_records_that_are_not_clone() {
        let mut b = ChannelBundle::<Frame>::builder("frames")
            .channels(["a", "b"])
            .obligations(2)
            .build();
        let tx = b.sender(["a", "b"]).unwrap();
        let tx_b = tx.clone();
        let rx = b.receiver(["a", "b"]).unwrap();

        tx.push("a", Frame(vec![1.0])).unwrap();
        tx_b.push("b", Frame(vec![2.0])).unwrap();
        tx.signal_producer_done();
        tx_b.signal_producer_done();

        assert_eq!(rx.pop("a").unwrap(), Popped::Record(Frame(vec![1.0])));
        assert_eq!(rx.pop("b").unwrap(), Popped::Record(Frame(vec![2.0])));
        assert_eq!(rx.pop("a").unwrap(), Popped::EndOfStream);
    }

    #[test]
    fn unknown_and_already_taken_channels_are_errors() {
        let mut b = bundle(&["a"], 1);
        assert!(matches!(
            b.sender(["nope"]),
            Err(PipelineError::UnknownChannel { .. })
        ));
        let _rx = b.receiver(["a"]).unwrap();
        assert!(b.receiver(["a"]).is_err());
    }

    #[test]
    fn pop_observes_cancellation() {
        let cancel = CancelToken::new_root();
        let mut b = ChannelBundle::<u32>::builder("inputs")
            .channel("a")
            .wait_policy(WaitPolicy::new(cancel.clone(), None))
            .build();
        let rx = b.receiver(["a"]).unwrap();

        let consumer = thread::spawn(move || rx.pop("a"));
        thread::sleep(Duration::from_millis(10));
        cancel.cancel();
        assert!(matches!(
            consumer.join().unwrap(),
            Err(PipelineError::Cancelled)
        ));
    }

    #[test]
    fn stalled_pop_and_push_time_out() {
        let policy = WaitPolicy::new(CancelToken::new_root(), Some(Duration::from_millis(20)));
        let mut b = ChannelBundle::<u32>::builder("outputs")
            .channel("torques")
            .capacity(Some(1))
            .wait_policy(policy)
            .build();
        let tx = b.sender(["torques"]).unwrap();
        let rx = b.receiver(["torques"]).unwrap();

        assert!(matches!(
            rx.pop("torques"),
            Err(PipelineError::Stalled { .. })
        ));

        tx.push("torques", 1).unwrap();
        match tx.push("torques", 2) {
            Err(PipelineError::Stalled { bundle, channel, .. }) => {
                assert_eq!(bundle, "outputs");
                assert_eq!(channel, "torques");
            }
            other => panic!("expected stall, got {other:?}"),
        }
    }

    #[test]
    fn bounded_channel_applies_backpressure() {
        let mut b = ChannelBundle::<u32>::builder("bp")
            .channel("a")
            .capacity(Some(2))
            .build();
        let tx = b.sender(["a"]).unwrap();
        let rx = b.receiver(["a"]).unwrap();

        let producer = thread::spawn(move || {
            for i in 0..10 {
                tx.push("a", i).unwrap();
            }
            tx.signal_producer_done();
        });

        thread::sleep(Duration::from_millis(10));
        assert!(!producer.is_finished());

        let mut got = Vec::new();
        while let Popped::Record(v) = rx.pop("a").unwrap() {
            got.push(v);
        }
        producer.join().unwrap();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }
}
