//! aarch64 context switching implementation
//!
//! AAPCS64: x19-x28, the frame pointer x29, the link register x30, sp and
//! the low halves of v8-v15 (d8-d15) are callee-saved.

use std::arch::naked_asm;

use super::EntryFn;

/// Callee-saved state of a suspended context
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub x: [u64; 10], // x19..x28, 0x00
    pub fp: u64,      // x29,      0x50
    pub lr: u64,      // x30,      0x58
    pub sp: u64,      //           0x60
    pub d: [u64; 8],  // d8..d15,  0x68
}

/// Initialize a fresh context
///
/// # Safety
///
/// `regs` must point to valid SavedRegs memory.
/// `stack_top` must be the high end of a mapped stack.
#[inline]
pub unsafe fn init_context(regs: *mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let regs = &mut *regs;
    *regs = SavedRegs::default();
    regs.sp = ((stack_top as usize) & !0xF) as u64;
    regs.lr = entry_trampoline as usize as u64;
    regs.x[0] = entry as usize as u64; // x19
    regs.x[1] = arg as u64; // x20
}

#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #1",
    );
}

/// Save the running context into `old` and resume `new`
///
/// # Safety
///
/// `new` must hold a context saved by this function or prepared by
/// `init_context`, whose stack is still mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save to old (x0)
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from new (x1)
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        // Saved contexts resume after their call; fresh ones at the trampoline
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_layout_matches_asm() {
        assert_eq!(offset_of!(SavedRegs, fp), 0x50);
        assert_eq!(offset_of!(SavedRegs, lr), 0x58);
        assert_eq!(offset_of!(SavedRegs, sp), 0x60);
        assert_eq!(offset_of!(SavedRegs, d), 0x68);
    }
}
