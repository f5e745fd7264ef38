//! Purpose: Bounded FIFO bridging asynchronous producers to a blocking consumer.
//! Exports: `bounded`, `FifoSender`, `FifoReceiver`, `FifoCloser`, `FullPolicy`, `TryRecv`.
//! Role: Backing store of reply channels and channel-style sample handlers.
//! Invariants: Dequeue order equals enqueue order; capacity is fixed at creation.
//! Invariants: Items queued before close are drained before `recv` reports end-of-stream.
//! Invariants: A passed deadline behaves exactly like `close`.
use crate::core::error::{Error, ErrorKind};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// What `send` does when the channel is at capacity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FullPolicy {
    #[default]
    Block,
    Fail,
}

impl FullPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "block" => Some(FullPolicy::Block),
            "fail" => Some(FullPolicy::Fail),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FullPolicy::Block => "block",
            FullPolicy::Fail => "fail",
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum TryRecv<T> {
    Item(T),
    Empty,
    Closed,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
    senders: usize,
    receiver_alive: bool,
    deadline: Option<Instant>,
}

impl<T> State<T> {
    fn expire(&mut self, now: Instant) -> bool {
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                self.closed = true;
            }
        }
        self.closed
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

pub struct FifoSender<T> {
    shared: Arc<Shared<T>>,
    policy: FullPolicy,
}

pub struct FifoReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Closes a channel without keeping it alive or counting as a producer.
pub struct FifoCloser<T> {
    shared: Weak<Shared<T>>,
}

pub fn bounded<T>(capacity: usize, policy: FullPolicy) -> Result<(FifoSender<T>, FifoReceiver<T>), Error> {
    if capacity == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("channel capacity must be at least 1"));
    }
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            closed: false,
            senders: 1,
            receiver_alive: true,
            deadline: None,
        }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
        capacity,
    });
    Ok((
        FifoSender {
            shared: shared.clone(),
            policy,
        },
        FifoReceiver { shared },
    ))
}

impl<T> FifoSender<T> {
    pub fn send(&self, item: T) -> Result<(), Error> {
        let mut state = self.shared.lock();
        loop {
            if !state.receiver_alive || state.expire(Instant::now()) {
                return Err(closed());
            }
            if state.queue.len() < self.shared.capacity {
                state.queue.push_back(item);
                drop(state);
                self.shared.not_empty.notify_one();
                return Ok(());
            }
            if self.policy == FullPolicy::Fail {
                return Err(Error::new(ErrorKind::ChannelFull).with_message(format!(
                    "channel is at capacity ({})",
                    self.shared.capacity
                )));
            }
            state = match state.deadline {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    self.shared
                        .not_full
                        .wait_timeout(state, wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .shared
                    .not_full
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Marks the channel finished for every producer.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        let mut state = self.shared.lock();
        !state.receiver_alive || state.expire(Instant::now())
    }

    pub fn policy(&self) -> FullPolicy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Tightens the deadline; a later deadline than the current one is ignored.
    pub fn set_deadline(&self, deadline: Instant) {
        let mut state = self.shared.lock();
        state.deadline = Some(match state.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    pub fn closer(&self) -> FifoCloser<T> {
        FifoCloser {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl<T> Clone for FifoSender<T> {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: self.shared.clone(),
            policy: self.policy,
        }
    }
}

impl<T> Drop for FifoSender<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.senders -= 1;
        if state.senders == 0 {
            state.closed = true;
            drop(state);
            self.shared.not_empty.notify_all();
        }
    }
}

impl<T> FifoReceiver<T> {
    /// Blocks until an item arrives; `None` once closed and drained.
    pub fn recv(&self) -> Option<T> {
        let mut state = self.shared.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Some(item);
            }
            if state.expire(Instant::now()) {
                return None;
            }
            state = match state.deadline {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    self.shared
                        .not_empty
                        .wait_timeout(state, wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .shared
                    .not_empty
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    pub fn try_recv(&self) -> TryRecv<T> {
        let mut state = self.shared.lock();
        if let Some(item) = state.queue.pop_front() {
            drop(state);
            self.shared.not_full.notify_one();
            return TryRecv::Item(item);
        }
        if state.expire(Instant::now()) {
            return TryRecv::Closed;
        }
        TryRecv::Empty
    }

    pub fn recv_timeout(&self, timeout: Duration) -> TryRecv<T> {
        let until = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return TryRecv::Item(item);
            }
            let now = Instant::now();
            if state.expire(now) {
                return TryRecv::Closed;
            }
            if now >= until {
                return TryRecv::Empty;
            }
            let mut wait = until - now;
            if let Some(deadline) = state.deadline {
                wait = wait.min(deadline.saturating_duration_since(now));
            }
            state = self
                .shared
                .not_empty
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Iterator for FifoReceiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.recv()
    }
}

impl<T> Drop for FifoReceiver<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.receiver_alive = false;
        state.queue.clear();
        drop(state);
        self.shared.not_full.notify_all();
    }
}

impl<T> FifoCloser<T> {
    pub fn close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.close();
        }
    }

    pub fn is_released(&self) -> bool {
        self.shared.strong_count() == 0
    }
}

fn closed() -> Error {
    Error::new(ErrorKind::ChannelClosed).with_message("channel is closed")
}

#[cfg(test)]
mod tests {
    use super::{FullPolicy, TryRecv, bounded};
    use crate::core::error::ErrorKind;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn zero_capacity_is_rejected() {
        let err = bounded::<u8>(0, FullPolicy::Block).err().expect("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn preserves_send_order_then_reports_end_of_stream() {
        let (tx, rx) = bounded(8, FullPolicy::Block).expect("channel");
        for i in 0..8 {
            tx.send(i).expect("send");
        }
        tx.close();
        for i in 0..8 {
            assert_eq!(rx.recv(), Some(i));
        }
        assert_eq!(rx.recv(), None);
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn dropping_last_sender_closes() {
        let (tx, rx) = bounded(2, FullPolicy::Block).expect("channel");
        let second = tx.clone();
        tx.send(1).expect("send");
        drop(tx);
        assert_eq!(rx.try_recv(), TryRecv::Item(1));
        assert_eq!(rx.try_recv(), TryRecv::Empty);
        drop(second);
        assert_eq!(rx.try_recv(), TryRecv::Closed);
    }

    #[test]
    fn fail_policy_reports_full() {
        let (tx, rx) = bounded(2, FullPolicy::Fail).expect("channel");
        tx.send(1).expect("send");
        tx.send(2).expect("send");
        let err = tx.send(3).expect_err("full");
        assert_eq!(err.kind(), ErrorKind::ChannelFull);
        assert_eq!(rx.recv(), Some(1));
        tx.send(3).expect("send after drain");
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn block_policy_waits_for_space() {
        let (tx, rx) = bounded(1, FullPolicy::Block).expect("channel");
        tx.send(1).expect("send");
        let producer = thread::spawn(move || {
            tx.send(2).expect("blocked send");
            tx.send(3).expect("blocked send");
        });
        thread::sleep(Duration::from_millis(20));
        let received: Vec<_> = rx.take(3).collect();
        producer.join().expect("join");
        assert_eq!(received, vec![1, 2, 3]);
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let (tx, rx) = bounded::<u8>(4, FullPolicy::Block).expect("channel");
        let closer = tx.closer();
        let consumer = thread::spawn(move || rx.recv());
        thread::sleep(Duration::from_millis(20));
        closer.close();
        assert_eq!(consumer.join().expect("join"), None);
        let err = tx.send(1).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
    }

    #[test]
    fn send_after_receiver_drop_fails() {
        let (tx, rx) = bounded(1, FullPolicy::Block).expect("channel");
        tx.send(1).expect("send");
        drop(rx);
        assert_eq!(tx.send(2).expect_err("closed").kind(), ErrorKind::ChannelClosed);
        assert!(tx.is_closed());
    }

    #[test]
    fn deadline_acts_as_close() {
        let (tx, rx) = bounded(4, FullPolicy::Block).expect("channel");
        tx.send(1).expect("send");
        tx.set_deadline(Instant::now() + Duration::from_millis(30));
        let started = Instant::now();
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.recv(), None);
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert_eq!(tx.send(2).expect_err("expired").kind(), ErrorKind::ChannelClosed);
    }

    #[test]
    fn recv_timeout_returns_empty_while_open() {
        let (tx, rx) = bounded::<u8>(1, FullPolicy::Block).expect("channel");
        assert_eq!(rx.recv_timeout(Duration::from_millis(5)), TryRecv::Empty);
        tx.send(9).expect("send");
        assert_eq!(rx.recv_timeout(Duration::from_millis(5)), TryRecv::Item(9));
        assert!(!tx.closer().is_released());
    }

    #[test]
    fn closer_does_not_keep_channel_alive() {
        let (tx, rx) = bounded::<u8>(1, FullPolicy::Block).expect("channel");
        let closer = tx.closer();
        drop(tx);
        drop(rx);
        assert!(closer.is_released());
        closer.close();
    }
}

impl<T> std::fmt::Debug for FifoReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoReceiver").finish_non_exhaustive()
    }
}
