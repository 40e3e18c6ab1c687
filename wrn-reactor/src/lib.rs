//! Sharded single-threaded event loops.
//!
//! A [`Reactor`] owns N sub-reactors, each a dedicated thread driving a
//! map of handlers. Handlers expose `{tick, has_ready, ready, step}`;
//! `step` is the sole mutator after construction, and harvested action
//! batches are dispatched to the [`ActionProcessor`] outside the handler's
//! critical section so the handler stays responsive. All cross-shard
//! communication is message passing through the sub-reactor inboxes.

mod queue;
mod sub;

pub use queue::MsgQueue;
pub use sub::{ActionProcessor, Handler, Reactor, ReactorOptions};
