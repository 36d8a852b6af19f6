// commit flags for channel operations.
//
// every pending operation (a put, a take, or one branch of a select) carries a flag. solo
// operations get a private flag; all branches of one select share a single flag. an operation
// may only complete by claiming its flag, and cancelling an operation claims the flag too, so
// nothing can complete it afterwards. this is what lets a select commit exactly one branch and
// walk away from the others without leaving any trace in their channels.
//
// pairing two operations (a rendezvous hand-off) claims both flags, locking them in ascending
// id order so that two channels pairing concurrently can never deadlock on each other's flags.
// flags are always locked while already holding exactly one channel mutex, and the flag
// critical sections touch nothing but the flag itself, so the lock hierarchy stays acyclic.

use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc, Mutex,
};

// source of unique flag ids.
static NEXT_FLAG_ID: AtomicU64 = AtomicU64::new(0);

// commit flag shared by every operation of one selection scope.
pub(crate) struct Flag {
    // unique id, used only to order two-flag claims.
    id: u64,
    // whether some operation in this scope has committed or been cancelled.
    decided: Mutex<bool>,
}

impl Flag {
    // construct an undecided flag with a fresh id.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Flag {
            id: NEXT_FLAG_ID.fetch_add(1, Relaxed),
            decided: Mutex::new(false),
        })
    }

    // try to claim this flag alone. returns whether the claim won.
    pub(crate) fn try_claim(&self) -> bool {
        let mut decided = self.decided.lock().unwrap();
        if *decided {
            false
        } else {
            *decided = true;
            true
        }
    }

    // whether this flag has been decided, without claiming it.
    pub(crate) fn is_decided(&self) -> bool {
        *self.decided.lock().unwrap()
    }
}

// outcome of trying to claim two flags together.
pub(crate) enum PairClaim {
    // both flags were undecided and are now claimed.
    Won,
    // our own flag was already decided. the whole selection scope is finished; stop scanning.
    OursDead,
    // only the counterparty's flag was decided. skip it and try the next one.
    TheirsDead,
}

// try to claim `ours` and `theirs` together, or neither.
pub(crate) fn claim_pair(ours: &Arc<Flag>, theirs: &Arc<Flag>) -> PairClaim {
    if Arc::ptr_eq(ours, theirs) {
        // two branches of the same select can never complete each other
        return PairClaim::TheirsDead;
    }
    let ours_first = ours.id < theirs.id;
    let (first, second) = if ours_first { (ours, theirs) } else { (theirs, ours) };

    let mut first_decided = first.decided.lock().unwrap();
    if *first_decided {
        return if ours_first { PairClaim::OursDead } else { PairClaim::TheirsDead };
    }
    let mut second_decided = second.decided.lock().unwrap();
    if *second_decided {
        return if ours_first { PairClaim::TheirsDead } else { PairClaim::OursDead };
    }
    *first_decided = true;
    *second_decided = true;
    PairClaim::Won
}
