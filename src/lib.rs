//! A user-space cooperative multitasking runtime: many independently
//! scheduled "cothreads" on one OS thread, communicating by synchronous
//! rendezvous message passing instead of shared memory.
//!
//! Unlike a typical stackful-coroutine library, cothreads do not each carry
//! a private stack at rest. A [`Group`] owns a small pool of large shared
//! *run stacks*; a "heavy" cothread occupies one of them only while running,
//! and its live bytes are copied into a compact private buffer the instant
//! it suspends. A cothread may opt into "light-weight" mode instead, which
//! allocates a small dedicated stack and skips that copy entirely, at the
//! cost of owning memory it may rarely use.
//!
//! ```
//! use costep::{Group, Message};
//!
//! fn doubler(me: &costep::Cothread, first: Message) {
//!     let mut n = first.into_usize();
//!     loop {
//!         n = me.r#yield(Message::from_usize(n * 2)).into_usize();
//!     }
//! }
//!
//! let group = Group::create(4, costep::MIN_STK_CAP);
//! let main = group.main();
//! let worker = main.create(doubler, true);
//!
//! let reply = main.send(&worker, Message::from_usize(21)).unwrap();
//! assert_eq!(reply.into_usize(), 42);
//!
//! worker.destroy();
//! group.destroy();
//! ```
//!
//! # Misuse is fatal, not recoverable
//!
//! Only one cothread per group is ever running, and only that cothread may
//! call into the group's API. Violating that, destroying a running
//! cothread, sending across groups, or any allocation failure panics the
//! process rather than returning an error: by the time such a call is
//! reachable a run stack may already be half backed-up, and there is no
//! sound way to unwind across a foreign stack. The single exception is
//! sending to a cothread that has already exited, reported as
//! [`SendError::Closed`].

mod arch;
mod cothread;
mod error;
mod group;
mod message;
mod run_stack;
mod stack;

pub use cothread::CothreadState;
pub use error::SendError;
pub use group::{Cothread, EntryFn, Group, MAX_STK_CAP, MAX_STK_NUM, MIN_STK_CAP, MIN_STK_NUM};
pub use message::Message;
