//! x86_64 context switching implementation
//!
//! System V AMD64: rbx, rbp, r12-r15, the MXCSR control bits and the x87
//! control word are callee-saved. Uses naked functions, stable since
//! Rust 1.88.

use std::arch::naked_asm;

use super::EntryFn;

/// Callee-saved state of a suspended context
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64,    // 0x00
    pub rip: u64,    // 0x08
    pub rbx: u64,    // 0x10
    pub rbp: u64,    // 0x18
    pub r12: u64,    // 0x20
    pub r13: u64,    // 0x28
    pub r14: u64,    // 0x30
    pub r15: u64,    // 0x38
    pub mxcsr: u32,  // 0x40
    pub fpucw: u16,  // 0x44
    _pad: u16,
}

const DEFAULT_MXCSR: u32 = 0x1F80;
const DEFAULT_FPUCW: u16 = 0x037F;

/// Initialize a fresh context
///
/// When first switched to, execution begins in the trampoline on the new
/// stack, which calls `entry(arg)`.
///
/// # Safety
///
/// `regs` must point to valid SavedRegs memory.
/// `stack_top` must be the high end of a mapped stack.
#[inline]
pub unsafe fn init_context(regs: *mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline's `call` pushes 8 bytes, so the callee starts with
    // rsp = 8 (mod 16) as the ABI requires.
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    *regs = SavedRegs::default();
    regs.rsp = aligned_sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.r12 = entry as usize as u64;
    regs.r13 = arg as u64;
    regs.mxcsr = DEFAULT_MXCSR;
    regs.fpucw = DEFAULT_FPUCW;
}

/// First code run on a fresh stack: `entry(arg)`, which never returns
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the running context into `old` and resume `new`
///
/// Returns when some other context switches back into `old`.
///
/// # Safety
///
/// `new` must hold a context saved by this function or prepared by
/// `init_context`, whose stack is still mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers to old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr [rdi + 0x40]",
        "fnstcw [rdi + 0x44]",
        // Load from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr [rsi + 0x40]",
        "fldcw [rsi + 0x44]",
        "jmp rax",
        // Resume point of a saved context
        "1:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_layout_matches_asm() {
        assert_eq!(offset_of!(SavedRegs, rsp), 0x00);
        assert_eq!(offset_of!(SavedRegs, rip), 0x08);
        assert_eq!(offset_of!(SavedRegs, r15), 0x38);
        assert_eq!(offset_of!(SavedRegs, mxcsr), 0x40);
        assert_eq!(offset_of!(SavedRegs, fpucw), 0x44);
    }

    #[test]
    fn test_init_aligns_stack() {
        extern "C" fn never(_: usize) -> ! {
            std::process::abort()
        }

        let mut buf = [0u8; 256];
        let top = unsafe { buf.as_mut_ptr().add(buf.len() - 3) };
        let mut regs = SavedRegs::default();
        unsafe { init_context(&mut regs, top, never, 42) };

        assert_eq!(regs.rsp % 16, 0);
        assert!(regs.rsp <= top as u64);
        assert_eq!(regs.r13, 42);
        assert_eq!(regs.mxcsr, DEFAULT_MXCSR);
    }
}
