// the message buffer part of a channel.

use std::collections::VecDeque;

/// What a channel does when a put arrives while its buffer is full.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OverflowPolicy {
    /// The put parks until space frees up or the channel closes.
    Park,
    /// The oldest buffered message is evicted to make room for the new one.
    DropOldest,
    /// The new message is discarded; the buffer keeps what it already holds.
    DropNewest,
}

// bounded FIFO storage for buffered messages.
pub(crate) struct Buffer<T> {
    elems: VecDeque<T>,
    capacity: usize,
    policy: OverflowPolicy,
}

// outcome of offering a message to the buffer.
pub(crate) enum PushOutcome<T> {
    // stored. the put succeeds.
    Stored,
    // stored after evicting the oldest message. the put succeeds.
    DroppedOldest(T),
    // the incoming message was discarded. the put still succeeds.
    DroppedNewest(T),
    // no room and the policy parks. the caller suspends, keeping the message.
    Full(T),
}

impl<T> Buffer<T> {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        debug_assert!(
            capacity > 0 || policy == OverflowPolicy::Park,
            "internal bug: drop policy with zero capacity",
        );
        Buffer {
            elems: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            policy,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub(crate) fn len(&self) -> usize {
        self.elems.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub(crate) fn has_room(&self) -> bool {
        self.elems.len() < self.capacity
    }

    // offer a message. never returns `Full` unless the policy is `Park`.
    pub(crate) fn push(&mut self, msg: T) -> PushOutcome<T> {
        if self.elems.len() < self.capacity {
            self.elems.push_back(msg);
            return PushOutcome::Stored;
        }
        match self.policy {
            OverflowPolicy::Park => PushOutcome::Full(msg),
            OverflowPolicy::DropOldest => {
                let evicted = self.elems.pop_front().expect("internal bug: full yet empty");
                self.elems.push_back(msg);
                PushOutcome::DroppedOldest(evicted)
            }
            OverflowPolicy::DropNewest => PushOutcome::DroppedNewest(msg),
        }
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        self.elems.pop_front()
    }
}
