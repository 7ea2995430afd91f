//! Stack transfer for AAPCS64 targets.

use std::arch::naked_asm;

use super::Entry;

/// Machine state of a greenlet while it is not running.
///
/// sp, lr and fp locate the resume point; x19-x28 and the low halves of
/// v8-v15 are what AAPCS64 expects a callee to preserve.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub(crate) struct Registers {
    sp: u64,
    /// Resume address
    lr: u64,
    fp: u64,
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    d8: u64,
    d9: u64,
    d10: u64,
    d11: u64,
    d12: u64,
    d13: u64,
    d14: u64,
    d15: u64,
}

impl Registers {
    /// State whose first resume calls `entry(arg)` at `stack_top`.
    ///
    /// `arg` rides in x19 until the trampoline moves it into the first
    /// argument register. `entry` must never return.
    ///
    /// # Safety
    /// `stack_top` must be the 16-byte aligned top of a mapped, writable
    /// stack that stays mapped for as long as the registers are in use.
    pub(crate) unsafe fn new(stack_top: usize, entry: Entry, arg: *mut std::ffi::c_void) -> Self {
        // `ret` jumps to lr, so the first resume lands in the trampoline.
        Registers {
            sp: stack_top as u64,
            lr: trampoline as usize as u64,
            x19: arg as u64,
            x20: entry as usize as u64,
            ..Default::default()
        }
    }
}

/// First code run on a fresh stack.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() -> ! {
    naked_asm!(
        // Terminate frame-pointer chains here
        "mov fp, xzr",
        "mov x0, x19",
        "blr x20",
        "brk #0x1",
    );
}

/// Parks the running greenlet in `from` and resumes the one saved in `to`.
///
/// Returns only once some later `transfer` names `from` as its target.
///
/// # Safety
/// `from` must be writable and `to` must hold state produced by `transfer`
/// or `Registers::new` for a stack that is still mapped and not running.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn transfer(_from: *mut Registers, _to: *const Registers) {
    naked_asm!(
        // x0 = from
        "mov x9, sp",
        "str x9,  [x0, #0x00]", // sp
        "str lr,  [x0, #0x08]", // lr (x30)
        "str fp,  [x0, #0x10]", // fp (x29)
        "stp x19, x20, [x0, #0x18]",
        "stp x21, x22, [x0, #0x28]",
        "stp x23, x24, [x0, #0x38]",
        "stp x25, x26, [x0, #0x48]",
        "stp x27, x28, [x0, #0x58]",
        "stp d8,  d9,  [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // x1 = to
        "ldr x9,  [x1, #0x00]", // sp
        "mov sp, x9",
        "ldr lr,  [x1, #0x08]", // lr (x30)
        "ldr fp,  [x1, #0x10]", // fp (x29)
        "ldp x19, x20, [x1, #0x18]",
        "ldp x21, x22, [x1, #0x28]",
        "ldp x23, x24, [x1, #0x38]",
        "ldp x25, x26, [x1, #0x48]",
        "ldp x27, x28, [x1, #0x58]",
        "ldp d8,  d9,  [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        // Resume at lr: the trampoline for a fresh stack, the caller of
        // transfer for a suspended one
        "ret",
    );
}
