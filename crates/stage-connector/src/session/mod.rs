//! Session lifecycle: state machine, reconnect policy, send buffering and the
//! task that drives them

mod backoff;
mod buffer;
pub(crate) mod driver;
mod machine;

pub use backoff::{BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use buffer::SendBuffer;
pub use machine::{InvalidTransition, SequenceGap, Session, Transition};
