//! The one expected, reported failure mode: sending to a cothread that has
//! already exited. Everything else enumerated as a programmer error in the
//! data model's invariants is unrecoverable and panics instead (see the
//! crate's top-level docs).

use thiserror::Error;

/// Error returned by [`crate::Cothread::send`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The target cothread had already reached the `Exited` state, either
    /// before this `send` or during it. No reply was delivered.
    #[error("send target has already exited")]
    Closed,
}
