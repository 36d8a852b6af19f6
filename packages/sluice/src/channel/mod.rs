// implementation of the channel.
//
// module structure:
//
// - `core` is the engine: the buffer, the waiter queues, the commit flags, and the state
//   machine that resolves puts and takes. it is panicky about internal invariants and
//   unhelpful about misuse.
// - `api` is the exposed convenience layer: the typed handle, the public future types with
//   their blocking adjuncts, and the mapping from engine outcomes to public results.
// - `buffer`, `waiters`, and `flag` are core's parts. `polling` is the bridge that blocks an
//   OS thread on a future. `error` is the public error types.

pub(crate) mod api;
pub(crate) mod buffer;
pub(crate) mod core;
pub(crate) mod error;
pub(crate) mod flag;
pub(crate) mod polling;
mod waiters;
