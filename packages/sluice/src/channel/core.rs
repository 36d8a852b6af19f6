// minimal safe engine for the channel.
//
// architecture:
//
// - a channel handle wraps an `Arc<Shared>`. `Shared` holds one mutex around all mutable state
//   (`Lockable`) plus a closed flag that fast paths may read without the lock. every decision
//   that matters is re-checked under the lock.
// - `Lockable` holds the message buffer and two FIFO waiter queues, one for parked puts and one
//   for parked takes.
// - `Put` and `Take` are futures created in the linked state: the operation enqueues a waiter
//   node up front and resolves it across polls. completing any operation requires claiming its
//   commit flag (see flag.rs), which is how a select abandons its losing branches without side
//   effects.
// - capacity-0 channels never touch the buffer: a put completes by pairing with a parked take
//   and writing the message straight into the taker's node slot, or the reverse, a take pulling
//   the message out of a parked put. the pairing claims both flags atomically, so a hand-off
//   commits both sides or neither.
// - lock hierarchy: channel mutex first, then commit flags in ascending id order. nothing is
//   ever locked the other way around, and flag critical sections touch only the flag.
//
// wake discipline (decided under the channel lock, wakers invoked after unlocking):
//
// - a put that stores into the buffer wakes the front parked take, and the front parked put
//   when room remains for it.
// - a take that pops from the buffer refills the freed room from parked puts, completing them
//   passively in FIFO order, and wakes the next parked take if messages remain. on a closed
//   channel the next take is woken even when the pop ran the buffer dry, because its drained
//   sentinel is now due.
// - a take that resolves the drained sentinel wakes the next parked take, so the sentinel
//   cascades through every waiter left behind by close.
// - an operation that resolves dead, or is cancelled, wakes the next waiter in its queue,
//   which it may have been gating.
// - close steals and invokes every parked waker on both queues.
//
// rendezvous hand-offs need no successor wakes: a parked put or take is completed passively
// by its counterparty's poll and never has to reach the front on its own.
//
// dropping a linked future without resolving or cancelling it would leak its waiter node until
// the channel is dropped; the api layer's futures cancel on drop so this cannot happen through
// the exposed surface.

use super::{
    buffer::{Buffer, OverflowPolicy, PushOutcome},
    flag::Flag,
    waiters::{Claim, Token, WaiterQueue},
};
use smallvec::SmallVec;
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex, MutexGuard,
    },
    task::{Context, Poll, Waker},
};

// handle to a channel. clones share the same channel.
pub(crate) struct Channel<T>(Arc<Shared<T>>);

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel(Arc::clone(&self.0))
    }
}

// channel shared state.
struct Shared<T> {
    // mutex around all mutable state.
    lockable: Mutex<Lockable<T>>,
    // set once by close. fast paths read it without the lock; paths that act on it re-check
    // under the lock.
    closed: AtomicBool,
}

// channel mutable state.
struct Lockable<T> {
    // buffered messages. never used by capacity-0 channels.
    buffer: Buffer<T>,
    // parked puts, FIFO. each node's slot holds the undelivered message.
    putters: WaiterQueue<T>,
    // parked takes, FIFO. a node's slot is filled by a hand-off.
    takers: WaiterQueue<T>,
}

impl<T> Channel<T> {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Channel(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                buffer: Buffer::new(capacity, policy),
                putters: WaiterQueue::new(),
                takers: WaiterQueue::new(),
            }),
            closed: AtomicBool::new(false),
        }))
    }

    // lock-free view of the closed flag. may be stale the instant it is read.
    pub(crate) fn is_closed(&self) -> bool {
        self.0.closed.load(Relaxed)
    }

    pub(crate) fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    // live references to this channel, counting handles and linked operations.
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    fn lock(&self) -> MutexGuard<'_, Lockable<T>> {
        self.0.lockable.lock().unwrap()
    }

    // begin a put. the operation parks immediately and resolves across polls of the returned
    // future.
    pub(crate) fn put(&self, flag: Arc<Flag>, msg: T) -> Put<T> {
        let token = {
            let mut lock = self.lock();
            if self.0.closed.load(Relaxed) {
                return Put::closed(flag, msg);
            }
            lock.putters.enqueue(Arc::clone(&flag), Some(msg))
        };
        Put(PutRepr::Linked(Some(Op {
            chan: self.clone(),
            flag,
            token,
        })))
    }

    // begin a take. a closed channel still drains its buffer, so there is no cheap pre-resolved
    // form; every take goes through a node.
    pub(crate) fn take(&self, flag: Arc<Flag>) -> Take<T> {
        let token = self.lock().takers.enqueue(Arc::clone(&flag), None);
        Take(Some(Op {
            chan: self.clone(),
            flag,
            token,
        }))
    }

    // close the channel. idempotent; returns whether this call closed it.
    pub(crate) fn close(&self) -> bool {
        let mut wakers = SmallVec::<[Waker; 8]>::new();
        {
            let mut lock = self.lock();
            if self.0.closed.swap(true, Relaxed) {
                return false;
            }
            lock.putters.take_all_wakers(&mut wakers);
            lock.takers.take_all_wakers(&mut wakers);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

// state of a linked operation.
struct Op<T> {
    chan: Channel<T>,
    flag: Arc<Flag>,
    token: Token,
}

// pull parked puts into freed buffer room, completing them passively in FIFO order. the caller
// has already committed its own operation; only the putters' flags are claimed here.
fn refill_from_putters<T>(lockable: &mut Lockable<T>, wakers: &mut SmallVec<[Waker; 2]>) {
    while lockable.buffer.has_room() {
        let Some(putter) = lockable.putters.claim_front_solo() else {
            break;
        };
        let msg = putter
            .slot
            .take()
            .expect("internal bug: parked put without message");
        if let Some(waker) = putter.complete() {
            wakers.push(waker);
        }
        match lockable.buffer.push(msg) {
            PushOutcome::Stored => (),
            _ => unreachable!("internal bug: push refused with room"),
        }
    }
}

// in-progress put, created by `Channel::put`.
pub(crate) struct Put<T>(PutRepr<T>);

enum PutRepr<T> {
    // the channel was already closed when the put began. resolves without a node, but still
    // commits through the flag, so a sibling select branch completed concurrently from
    // another thread keeps its win and this branch reports dead.
    Closed {
        msg: Option<T>,
        flag: Arc<Flag>,
    },
    // normal path. `None` once the operation has resolved or been cancelled.
    Linked(Option<Op<T>>),
}

// resolution of a put.
pub(crate) enum PutPoll<T> {
    // delivered: stored in the buffer, handed to a taker, or dropped by policy.
    Sent,
    // the channel closed before delivery. gives the message back.
    Closed(T),
    // a sibling branch of the same select committed first.
    Dead,
}

// what became of a cancelled put.
pub(crate) enum PutCancel<T> {
    // never delivered. gives the message back.
    Refunded(T),
    // a counterparty had already accepted the message.
    Delivered,
    // the future had already resolved earlier.
    Spent,
}

impl<T> Put<T> {
    // pre-resolved put against a closed channel.
    pub(crate) fn closed(flag: Arc<Flag>, msg: T) -> Self {
        Put(PutRepr::Closed {
            msg: Some(msg),
            flag,
        })
    }

    // whether the future has resolved or been cancelled and may no longer be polled.
    pub(crate) fn is_terminated(&self) -> bool {
        match &self.0 {
            PutRepr::Closed { msg, .. } => msg.is_none(),
            PutRepr::Linked(op) => op.is_none(),
        }
    }

    fn poll_inner(&mut self, cx: &mut Context) -> Poll<PutPoll<T>> {
        let op = match &mut self.0 {
            PutRepr::Closed { msg, flag } => {
                let msg = msg.take().expect("put future polled after resolving");
                return Poll::Ready(if flag.try_claim() {
                    PutPoll::Closed(msg)
                } else {
                    PutPoll::Dead
                });
            }
            PutRepr::Linked(op) => op.take().expect("put future polled after resolving"),
        };

        let mut lock = op.chan.lock();
        let lockable = &mut *lock;

        // a counterparty may have completed us passively since the last poll
        if lockable
            .putters
            .waiter_mut(op.token)
            .expect("internal bug: put node missing")
            .done
        {
            lockable.putters.remove(op.token);
            return Poll::Ready(PutPoll::Sent);
        }

        // parked puts fail once the channel closes, rather than deliver late
        if op.chan.0.closed.load(Relaxed) {
            let node = lockable
                .putters
                .remove(op.token)
                .expect("internal bug: put node missing");
            let msg = node
                .slot
                .expect("internal bug: parked put without message");
            return Poll::Ready(if op.flag.try_claim() {
                PutPoll::Closed(msg)
            } else {
                PutPoll::Dead
            });
        }

        if lockable.buffer.capacity() == 0 {
            // FIFO fairness: only the front contending put may resolve
            if lockable.putters.is_front(op.token) {
                // rendezvous: hand the message straight to a parked take
                let msg = lockable
                    .putters
                    .waiter_mut(op.token)
                    .expect("internal bug: put node missing")
                    .slot
                    .take()
                    .expect("internal bug: parked put without message");
                match lockable.takers.claim_front(&op.flag) {
                    Claim::Won(taker) => {
                        taker.slot = Some(msg);
                        let waker = taker.complete();
                        lockable.putters.remove(op.token);
                        drop(lock);
                        if let Some(waker) = waker {
                            waker.wake();
                        }
                        return Poll::Ready(PutPoll::Sent);
                    }
                    Claim::OursDead => {
                        lockable.putters.remove(op.token);
                        return Poll::Ready(PutPoll::Dead);
                    }
                    Claim::None => {
                        // no taker yet; restore the message and park
                        lockable
                            .putters
                            .waiter_mut(op.token)
                            .expect("internal bug: put node missing")
                            .slot = Some(msg);
                    }
                }
            }
        } else if lockable.buffer.policy() != OverflowPolicy::Park
            || (lockable.buffer.has_room() && lockable.putters.is_front(op.token))
        {
            // the store cannot fail now: there is room and we are the front contender, or a
            // drop policy admits the message regardless of either
            if !op.flag.try_claim() {
                lockable.putters.remove(op.token);
                // we may have been gating the put behind us
                let waker = lockable.putters.wake_front();
                drop(lock);
                if let Some(waker) = waker {
                    waker.wake();
                }
                return Poll::Ready(PutPoll::Dead);
            }
            let node = lockable
                .putters
                .remove(op.token)
                .expect("internal bug: put node missing");
            let msg = node
                .slot
                .expect("internal bug: parked put without message");
            match lockable.buffer.push(msg) {
                PushOutcome::Stored
                | PushOutcome::DroppedOldest(_)
                | PushOutcome::DroppedNewest(_) => (),
                PushOutcome::Full(_) => unreachable!("internal bug: push refused"),
            }
            let mut wakers = SmallVec::<[Waker; 2]>::new();
            if let Some(waker) = lockable.takers.wake_front() {
                wakers.push(waker);
            }
            if lockable.buffer.has_room() {
                // room remains for the put parked behind us
                if let Some(waker) = lockable.putters.wake_front() {
                    wakers.push(waker);
                }
            }
            drop(lock);
            for waker in wakers {
                waker.wake();
            }
            return Poll::Ready(PutPoll::Sent);
        }

        // park until a counterparty, a cancel, or a close wakes us
        lockable
            .putters
            .waiter_mut(op.token)
            .expect("internal bug: put node missing")
            .waker = Some(cx.waker().clone());
        drop(lock);
        self.0 = PutRepr::Linked(Some(op));
        Poll::Pending
    }

    // cancel the operation. claims the flag, so nothing can complete it afterwards.
    pub(crate) fn cancel(&mut self) -> PutCancel<T> {
        let op = match &mut self.0 {
            PutRepr::Closed { msg, flag } => {
                return match msg.take() {
                    Some(msg) => {
                        flag.try_claim();
                        PutCancel::Refunded(msg)
                    }
                    None => PutCancel::Spent,
                };
            }
            PutRepr::Linked(op) => match op.take() {
                Some(op) => op,
                None => return PutCancel::Spent,
            },
        };

        let mut lock = op.chan.lock();
        let node = lock
            .putters
            .remove(op.token)
            .expect("internal bug: put node missing");
        let outcome = if node.done {
            PutCancel::Delivered
        } else {
            // poison the flag; a sibling select branch may already hold it
            op.flag.try_claim();
            let msg = node
                .slot
                .expect("internal bug: parked put without message");
            PutCancel::Refunded(msg)
        };
        // our node may have been blocking the front of the queue
        let waker = lock.putters.wake_front();
        drop(lock);
        if let Some(waker) = waker {
            waker.wake();
        }
        outcome
    }
}

// safety of the marker: the future holds no self-references. the channel node owns the
// parked message, not a pointer into the future, and wakers point at the poller's signal.
impl<T> Unpin for Put<T> {}

impl<T> Future for Put<T> {
    type Output = PutPoll<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.get_mut().poll_inner(cx)
    }
}

// in-progress take, created by `Channel::take`. `None` once resolved or cancelled.
pub(crate) struct Take<T>(Option<Op<T>>);

// resolution of a take.
pub(crate) enum TakePoll<T> {
    // received a message.
    Msg(T),
    // the channel is closed and its buffer has run dry.
    Drained,
    // a sibling branch of the same select committed first.
    Dead,
}

// what became of a cancelled take.
pub(crate) enum TakeCancel<T> {
    // never received anything.
    Aborted,
    // a counterparty had already committed a message to this take.
    Delivered(T),
    // the future had already resolved earlier.
    Spent,
}

impl<T> Take<T> {
    pub(crate) fn is_terminated(&self) -> bool {
        self.0.is_none()
    }

    fn poll_inner(&mut self, cx: &mut Context) -> Poll<TakePoll<T>> {
        let op = self.0.take().expect("take future polled after resolving");

        let mut lock = op.chan.lock();
        let lockable = &mut *lock;

        // a counterparty may have handed us a message since the last poll
        if lockable
            .takers
            .waiter_mut(op.token)
            .expect("internal bug: take node missing")
            .done
        {
            let node = lockable
                .takers
                .remove(op.token)
                .expect("internal bug: take node missing");
            let msg = node
                .slot
                .expect("internal bug: completed take without message");
            return Poll::Ready(TakePoll::Msg(msg));
        }

        // FIFO fairness: only the front contending take may resolve
        if lockable.takers.is_front(op.token) {
            let closed = op.chan.0.closed.load(Relaxed);

            if !lockable.buffer.is_empty() {
                // drain the buffer; this also serves a closed channel until it runs dry
                if !op.flag.try_claim() {
                    lockable.takers.remove(op.token);
                    // we may have been gating the take behind us
                    let waker = lockable.takers.wake_front();
                    drop(lock);
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                    return Poll::Ready(TakePoll::Dead);
                }
                let msg = lockable
                    .buffer
                    .pop()
                    .expect("internal bug: non-empty buffer popped nothing");
                lockable.takers.remove(op.token);
                let mut wakers = SmallVec::<[Waker; 2]>::new();
                if !closed {
                    // freed room admits parked puts. after close they fail instead.
                    refill_from_putters(lockable, &mut wakers);
                }
                if !lockable.buffer.is_empty() || closed {
                    // messages remain, or the next take's drained sentinel is now due
                    if let Some(waker) = lockable.takers.wake_front() {
                        wakers.push(waker);
                    }
                }
                drop(lock);
                for waker in wakers {
                    waker.wake();
                }
                return Poll::Ready(TakePoll::Msg(msg));
            }

            if closed {
                // drained: the sentinel, forever. waking the next take cascades it through
                // every waiter left behind by close.
                lockable.takers.remove(op.token);
                let claimed = op.flag.try_claim();
                let waker = lockable.takers.wake_front();
                drop(lock);
                if let Some(waker) = waker {
                    waker.wake();
                }
                return Poll::Ready(if claimed {
                    TakePoll::Drained
                } else {
                    TakePoll::Dead
                });
            }

            // empty and open: pull the message out of a parked put (rendezvous hand-off)
            match lockable.putters.claim_front(&op.flag) {
                Claim::Won(putter) => {
                    let msg = putter
                        .slot
                        .take()
                        .expect("internal bug: parked put without message");
                    let waker = putter.complete();
                    lockable.takers.remove(op.token);
                    drop(lock);
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                    return Poll::Ready(TakePoll::Msg(msg));
                }
                Claim::OursDead => {
                    lockable.takers.remove(op.token);
                    return Poll::Ready(TakePoll::Dead);
                }
                Claim::None => (),
            }
        }

        // park until a counterparty, a cancel, or a close wakes us
        lockable
            .takers
            .waiter_mut(op.token)
            .expect("internal bug: take node missing")
            .waker = Some(cx.waker().clone());
        drop(lock);
        self.0 = Some(op);
        Poll::Pending
    }

    // cancel the operation. claims the flag, so nothing can complete it afterwards.
    pub(crate) fn cancel(&mut self) -> TakeCancel<T> {
        let Some(op) = self.0.take() else {
            return TakeCancel::Spent;
        };

        let mut lock = op.chan.lock();
        let node = lock
            .takers
            .remove(op.token)
            .expect("internal bug: take node missing");
        let outcome = if node.done {
            let msg = node
                .slot
                .expect("internal bug: completed take without message");
            TakeCancel::Delivered(msg)
        } else {
            op.flag.try_claim();
            TakeCancel::Aborted
        };
        let waker = lock.takers.wake_front();
        drop(lock);
        if let Some(waker) = waker {
            waker.wake();
        }
        outcome
    }
}

impl<T> Unpin for Take<T> {}

impl<T> Future for Take<T> {
    type Output = TakePoll<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.get_mut().poll_inner(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering::SeqCst},
        task::Wake,
    };

    // waker that counts its invocations, for driving the engine poll by poll
    struct CountingWake(AtomicUsize);

    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, SeqCst);
        }
    }

    fn test_waker() -> (Arc<CountingWake>, Waker) {
        let count = Arc::new(CountingWake(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&count));
        (count, waker)
    }

    #[test]
    fn storing_put_wakes_the_put_parked_behind_it() {
        let chan = Channel::new(2, OverflowPolicy::Park);
        let mut first = chan.put(Flag::new(), 1u32);
        let mut second = chan.put(Flag::new(), 2u32);

        let (count, waker) = test_waker();
        let mut cx = Context::from_waker(&waker);
        // parks behind the unresolved first put despite the empty buffer
        assert!(Pin::new(&mut second).poll(&mut cx).is_pending());
        assert_eq!(count.0.load(SeqCst), 0);

        let (_, first_waker) = test_waker();
        assert!(matches!(
            Pin::new(&mut first).poll(&mut Context::from_waker(&first_waker)),
            Poll::Ready(PutPoll::Sent),
        ));
        // the store left room, so the parked put must have been woken
        assert_eq!(count.0.load(SeqCst), 1);
        assert!(matches!(
            Pin::new(&mut second).poll(&mut cx),
            Poll::Ready(PutPoll::Sent),
        ));
        assert_eq!(chan.len(), 2);
    }

    #[test]
    fn sentinel_cascades_through_parked_takes() {
        let chan = Channel::<u32>::new(0, OverflowPolicy::Park);
        let mut front = chan.take(Flag::new());
        let mut back = chan.take(Flag::new());

        let (_, front_waker) = test_waker();
        let (back_count, back_waker) = test_waker();
        let mut front_cx = Context::from_waker(&front_waker);
        let mut back_cx = Context::from_waker(&back_waker);
        assert!(Pin::new(&mut front).poll(&mut front_cx).is_pending());
        assert!(Pin::new(&mut back).poll(&mut back_cx).is_pending());

        chan.close();
        assert_eq!(back_count.0.load(SeqCst), 1);
        // woken by close, the back take polls first and parks again behind the front one
        assert!(Pin::new(&mut back).poll(&mut back_cx).is_pending());
        // the front take resolves the sentinel and must pass the wake along
        assert!(matches!(
            Pin::new(&mut front).poll(&mut front_cx),
            Poll::Ready(TakePoll::Drained),
        ));
        assert_eq!(back_count.0.load(SeqCst), 2);
        assert!(matches!(
            Pin::new(&mut back).poll(&mut back_cx),
            Poll::Ready(TakePoll::Drained),
        ));
    }

    #[test]
    fn closed_pop_wakes_the_take_parked_behind_it() {
        let chan = Channel::new(1, OverflowPolicy::Park);
        let (_, setup_waker) = test_waker();
        let mut setup = chan.put(Flag::new(), 7u32);
        assert!(matches!(
            Pin::new(&mut setup).poll(&mut Context::from_waker(&setup_waker)),
            Poll::Ready(PutPoll::Sent),
        ));

        let mut front = chan.take(Flag::new());
        let mut back = chan.take(Flag::new());
        let (_, front_waker) = test_waker();
        let (back_count, back_waker) = test_waker();
        let mut back_cx = Context::from_waker(&back_waker);
        assert!(Pin::new(&mut back).poll(&mut back_cx).is_pending());

        chan.close();
        assert_eq!(back_count.0.load(SeqCst), 1);
        // woken by close, the back take polls first and parks again while the buffer drains
        assert!(Pin::new(&mut back).poll(&mut back_cx).is_pending());
        // the pop that runs the closed buffer dry must hand the wake to the survivor
        assert!(matches!(
            Pin::new(&mut front).poll(&mut Context::from_waker(&front_waker)),
            Poll::Ready(TakePoll::Msg(7)),
        ));
        assert_eq!(back_count.0.load(SeqCst), 2);
        assert!(matches!(
            Pin::new(&mut back).poll(&mut back_cx),
            Poll::Ready(TakePoll::Drained),
        ));
    }
}
