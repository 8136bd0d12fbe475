//! Per-architecture context switch primitive.
//!
//! Every backend exposes the same three items: `Trampoline` (the function
//! pointer type a primed stack resumes into), `prime_stack` (write the
//! initial resume frame), and `switch` (save/restore the callee-preserved
//! register set and swap stack pointers). The cothread pointer passed to
//! `switch` rides through in a register the assembly body never reads or
//! writes, so the resumed side sees it unchanged.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::*;
    } else {
        compile_error!("costep only implements the x86_64 and aarch64 context switch backends");
    }
}

/// Resume entry point for a freshly primed stack. Receives the cothread
/// pointer that was passed to the `switch` call that resumed it and never
/// returns.
pub type Trampoline = unsafe extern "C" fn(*mut u8) -> !;
