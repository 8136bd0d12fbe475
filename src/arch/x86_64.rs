// Context switch backend for x86_64 SysV. Register convention (rdi, rsi, rdx)
// and push/pop order mirror the reference C implementation's
// `asm_context_switch`: rdi carries the resumed cothread's pointer through
// untouched, rsi points at the slot to receive the caller's outgoing stack
// pointer, rdx is the target stack pointer value.

use core::arch::naked_asm;

use super::Trampoline;

/// Callee-preserved GPRs on the SysV x86_64 ABI: rbx, rbp, r12, r13, r14, r15.
pub const CALLEE_SAVED_COUNT: usize = 6;

/// Bytes occupied by a freshly primed (never-yet-resumed) stack frame: the
/// pushed resume address plus one zeroed word per callee-saved register.
pub const INITIAL_FRAME_BYTES: usize = (CALLEE_SAVED_COUNT + 1) * 8;

#[unsafe(naked)]
pub unsafe extern "C" fn switch(cth: *mut u8, from: *mut *mut u8, to: *mut u8) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rsi], rsp",
        "mov rsp, rdx",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// Writes a resume frame into the `INITIAL_FRAME_BYTES` bytes immediately
/// below `top`, and returns the stack pointer the first `switch` into this
/// stack should use. `top` need not be part of a live, mapped stack; callers
/// priming a heavy cothread's backup buffer pass a scratch buffer's end
/// instead, then copy the written bytes out verbatim.
pub unsafe fn prime_stack(top: *mut u8, trampoline: Trampoline) -> *mut u8 {
    unsafe {
        let mut sp = top.cast::<u64>();
        sp = sp.sub(1);
        sp.write(trampoline as usize as u64);
        for _ in 0..CALLEE_SAVED_COUNT {
            sp = sp.sub(1);
            sp.write(0);
        }
        sp.cast()
    }
}
