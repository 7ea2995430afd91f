//! Stack transfer for x86_64 System V targets.

use std::arch::naked_asm;

use super::Entry;

/// Default MXCSR: all exceptions masked, round to nearest.
const MXCSR_DEFAULT: u32 = 0x1F80;
/// Default x87 control word: extended precision, all exceptions masked.
const FPUCW_DEFAULT: u32 = 0x037F;

/// Machine state of a greenlet while it is not running.
///
/// Holds what System V makes the callee's job to keep (rsp, rbp, rbx,
/// r12-r15) and the floating-point control state (MXCSR and x87 control
/// word). Everything else is dead at the point `transfer` is called.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub(crate) struct Registers {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    mxcsr: u32,
    fpucw: u32,
}

impl Registers {
    /// State whose first resume calls `entry(arg)` at `stack_top`.
    ///
    /// `arg` rides in r15 until the trampoline moves it into the first
    /// argument register. `entry` must never return.
    ///
    /// # Safety
    /// `stack_top` must be the 16-byte aligned top of a mapped, writable
    /// stack that stays mapped for as long as the registers are in use.
    pub(crate) unsafe fn new(stack_top: usize, entry: Entry, arg: *mut std::ffi::c_void) -> Self {
        // `transfer` ends in `ret`, so the first resume pops the trampoline
        // address off the new stack:
        //
        //   stack_top - 8:  (padding, zero)
        //   stack_top - 16: return address (trampoline)
        let initial_rsp = stack_top - 16;

        unsafe {
            std::ptr::write(initial_rsp as *mut u64, trampoline as usize as u64);
            std::ptr::write((initial_rsp + 8) as *mut u64, 0);
        }

        Registers {
            rsp: initial_rsp as u64,
            r14: entry as usize as u64,
            r15: arg as u64,
            mxcsr: MXCSR_DEFAULT,
            fpucw: FPUCW_DEFAULT,
            ..Default::default()
        }
    }
}

/// First code run on a fresh stack.
///
/// Moves the parked argument into the first argument register, realigns the
/// stack as if called, and calls the entry function.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() -> ! {
    naked_asm!(
        // Terminate frame-pointer chains here
        "xor ebp, ebp",
        "mov rdi, r15",
        // RSP must be 16-byte aligned before `call`
        "and rsp, -16",
        "call r14",
        "ud2",
    );
}

/// Parks the running greenlet in `from` and resumes the one saved in `to`.
///
/// Returns only once some later `transfer` names `from` as its target, at
/// which point the caller continues as if this were an ordinary call.
///
/// # Safety
/// `from` must be writable and `to` must hold state produced by `transfer`
/// or `Registers::new` for a stack that is still mapped and not running.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn transfer(_from: *mut Registers, _to: *const Registers) {
    naked_asm!(
        // rdi = from
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr dword ptr [rdi + 0x38]",
        "fnstcw word ptr [rdi + 0x3c]",
        // rsi = to
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr dword ptr [rsi + 0x38]",
        "fldcw word ptr [rsi + 0x3c]",
        // Fresh stacks land in the trampoline, parked ones after their transfer
        "ret",
    );
}
