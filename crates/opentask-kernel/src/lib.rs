//! Task lifecycle primitives for OpenTask.
//!
//! This crate hosts the two pieces of shared plumbing every other OpenTask
//! crate relies on:
//!
//! - [`bus`] -- a named-event publish/subscribe bus with three delivery
//!   patterns (broadcast, pipeline, collect).
//! - [`stop`] -- a cooperative cancellation flag shared between the task
//!   loop and whichever surface wants to interrupt it.

pub mod bus;
pub mod stop;

pub use bus::{EventBus, Handler, Subscriber, events};
pub use stop::StopFlag;
