use crate::error::{SendError, TryRecvError};
use crate::utils::CancelToken;
use crossbeam::channel as cbchan;
use std::time::{Duration, Instant};

/// How long a blocking send sleeps between cancellation checks.
const SEND_TICK: Duration = Duration::from_millis(2);

/// FIFO record queue, unbounded unless a capacity is given.
pub struct RecordChannel;

impl RecordChannel {
    #[inline]
    pub fn bounded<T: Send + 'static>(capacity: usize) -> (ChannelSender<T>, ChannelReceiver<T>) {
        let (tx, rx) = cbchan::bounded::<T>(capacity);
        (ChannelSender { tx }, ChannelReceiver { rx })
    }

    #[inline]
    pub fn unbounded<T: Send + 'static>() -> (ChannelSender<T>, ChannelReceiver<T>) {
        let (tx, rx) = cbchan::unbounded::<T>();
        (ChannelSender { tx }, ChannelReceiver { rx })
    }

    /// `None` or `Some(0)` yield an unbounded channel.
    pub fn with_capacity<T: Send + 'static>(
        capacity: Option<usize>,
    ) -> (ChannelSender<T>, ChannelReceiver<T>) {
        match capacity {
            Some(cap) if cap > 0 => Self::bounded(cap),
            _ => Self::unbounded(),
        }
    }
}

pub struct ChannelSender<E> {
    tx: cbchan::Sender<E>,
}

// crossbeam senders clone for any `E`; a derive would demand `E: Clone`
impl<E> Clone for ChannelSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Send + 'static> ChannelSender<E> {
    /// Blocking send. Waits on a full channel until there is room, the token
    /// is cancelled, or `timeout` elapses.
    pub fn send(
        &self,
        mut a: E,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SendError<E>> {
        let start = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(SendError::cancelled(Some(a)));
            }
            if let Some(t) = timeout
                && start.elapsed() >= t
            {
                return Err(SendError::timeout(Some(a)));
            }

            match self.tx.send_timeout(a, SEND_TICK) {
                Ok(()) => return Ok(()),
                Err(cbchan::SendTimeoutError::Timeout(v)) => a = v,
                Err(cbchan::SendTimeoutError::Disconnected(v)) => {
                    return Err(SendError::closed(Some(v)));
                }
            }
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }
}

pub struct ChannelReceiver<E> {
    rx: cbchan::Receiver<E>,
}

impl<E: Send + 'static> ChannelReceiver<E> {
    #[inline]
    pub fn try_recv(&self) -> Result<E, TryRecvError> {
        match self.rx.try_recv() {
            Ok(v) => Ok(v),
            Err(cbchan::TryRecvError::Empty) => Err(TryRecvError::Empty),
            Err(cbchan::TryRecvError::Disconnected) => Err(TryRecvError::Disconnected),
        }
    }

    /// Waits up to `wait` for the next value. `Empty` means nothing arrived in time.
    #[inline]
    pub fn recv_for(&self, wait: Duration) -> Result<E, TryRecvError> {
        match self.rx.recv_timeout(wait) {
            Ok(v) => Ok(v),
            Err(cbchan::RecvTimeoutError::Timeout) => Err(TryRecvError::Empty),
            Err(cbchan::RecvTimeoutError::Disconnected) => Err(TryRecvError::Disconnected),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
