//! CSP-style channels and lightweight processes.
//!
//! The pieces:
//!
//! - [`Channel`]: a FIFO conveyance with a fixed capacity, an overflow policy, and close
//!   semantics. Capacity 0 means rendezvous: every delivery is a meeting of a put and a take.
//! - [`runtime`]: a fixed pool of worker threads multiplexing many parked processes, plus
//!   [`runtime::thread`] as the escape hatch for work that genuinely blocks.
//! - [`Select`]: race several channel operations and commit exactly one, with the losers
//!   abandoned without side effects.
//! - [`timer::after`]: channels that close at a deadline, making timeouts compose like any
//!   other channel.
//! - the sibling `swapcell` crate: shared state for the cases channels alone do not cover.
//!
//! Processes suspend only at channel operations. From async code, `.await` the put/take/select
//! futures; from plain threads, use their blocking adjuncts (`block`, `block_timeout`,
//! `try_now`). The two worlds interoperate on the same channels.

#[macro_use]
extern crate tracing;

mod channel;

pub mod runtime;
pub mod select;
pub mod timer;

pub use crate::channel::api::*;
pub use crate::channel::buffer::OverflowPolicy;
pub use crate::runtime::{spawn, thread, Runtime, RuntimeBuilder};
pub use crate::select::{Select, Selected};
pub use crate::timer::after;

/// Error types.
pub mod error {
    pub use crate::channel::error::{
        PutError, PutTimeoutError, TakeTimeoutError, TryPutCause, TryPutError, TryTakeError,
    };
}

/// Future types.
pub mod future {
    pub use crate::channel::api::{PutFut, TakeFut};
    pub use crate::select::SelectFut;
}
