//! A single machine-word message payload exchanged by every rendezvous
//! operation. Applications choose what it means: a tagged integer, or a
//! pointer into data the sender keeps alive for the duration of the call.

/// An opaque word-sized value passed between cothreads.
///
/// Construction and extraction are symmetric: whichever conversion the
/// sender used to build a `Message`, the receiver uses to read it back.
/// Mismatched use (e.g. `from_ptr::<A>` then `into_ptr::<B>`) is a logic
/// error the type cannot catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Message(u64);

impl Message {
    /// The zero message, used as a placeholder where no payload is needed.
    pub const NONE: Message = Message(0);

    pub const fn from_raw(value: u64) -> Self {
        Message(value)
    }

    pub const fn into_raw(self) -> u64 {
        self.0
    }

    pub fn from_usize(value: usize) -> Self {
        Message(value as u64)
    }

    pub fn into_usize(self) -> usize {
        self.0 as usize
    }

    /// Wraps a raw pointer. The caller is responsible for keeping the
    /// pointee alive until the receiver is done with it.
    pub fn from_ptr<T>(ptr: *mut T) -> Self {
        Message(ptr as u64)
    }

    /// Recovers a pointer previously wrapped with [`Message::from_ptr`].
    pub fn into_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl From<u64> for Message {
    fn from(value: u64) -> Self {
        Message::from_raw(value)
    }
}

impl From<Message> for u64 {
    fn from(message: Message) -> Self {
        message.into_raw()
    }
}
