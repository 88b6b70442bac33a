// Thin wrappers around the x86 instructions the kernel needs directly.
// Written in the same inline-asm idiom as the existing inb/outb below
// (string-literal operands, not the newer named-operand asm! macro).

use crate::gdt::DescriptorTablePointer;
use crate::pmap::{PhysAddr, VirtAddr};

#[inline]
pub(crate) fn inb(port: u16) -> u8 {
    unsafe {
        let value: u8;
        asm!("inb $1, $0" : "={al}"(value) :"N{dx}"(port) :: "volatile");
        value
    }
}

#[inline]
pub(crate) fn outb(port: u16, value: u8) {
    unsafe {
        asm!("outb $1, $0" :: "N{dx}"(port), "{al}"(value) :: "volatile");
    }
}

/// Load the page directory base register.
#[inline]
pub(crate) fn lcr3(pa: PhysAddr) {
    unsafe {
        asm!("movl $0, %cr3" :: "r"(pa.0) : "memory" : "volatile");
    }
}

/// Read the page directory base register.
#[inline]
pub(crate) fn rcr3() -> PhysAddr {
    let val: u32;
    unsafe {
        asm!("movl %cr3, $0" : "=r"(val) ::: "volatile");
    }
    PhysAddr(val)
}

/// Read the faulting address recorded by the last page fault.
#[inline]
pub(crate) fn rcr2() -> u32 {
    let val: u32;
    unsafe {
        asm!("movl %cr2, $0" : "=r"(val) ::: "volatile");
    }
    val
}

/// Read CR0.
#[inline]
pub(crate) fn rcr0() -> u32 {
    let val: u32;
    unsafe {
        asm!("movl %cr0, $0" : "=r"(val) ::: "volatile");
    }
    val
}

/// Write CR0.
#[inline]
pub(crate) fn lcr0(val: u32) {
    unsafe {
        asm!("movl $0, %cr0" :: "r"(val) : "memory" : "volatile");
    }
}

/// Load the interrupt descriptor table register.
#[inline]
pub(crate) fn lidt(dtp: &DescriptorTablePointer) {
    unsafe {
        asm!("lidt ($0)" :: "r"(dtp) : "memory" : "volatile");
    }
}

/// Load the global descriptor table register.
#[inline]
pub(crate) fn lgdt(dtp: &DescriptorTablePointer) {
    unsafe {
        asm!("lgdt ($0)" :: "r"(dtp) : "memory" : "volatile");
    }
}

/// Load the task register with a GDT selector.
#[inline]
pub(crate) fn ltr(selector: u16) {
    unsafe {
        asm!("ltr $0" :: "r"(selector) : "memory" : "volatile");
    }
}

/// Load the local descriptor table register.
#[inline]
pub(crate) fn lldt(dtp: &DescriptorTablePointer) {
    unsafe {
        asm!("lldt ($0)" :: "r"(dtp) : "memory" : "volatile");
    }
}

/// Read the current eflags register.
#[inline]
pub(crate) fn read_eflags() -> u32 {
    let val: u32;
    unsafe {
        asm!("pushfl; popl $0" : "=r"(val) ::: "volatile");
    }
    val
}

/// Clear the direction flag, as the trap entry path requires on every kernel entry.
#[inline]
pub(crate) fn cld() {
    unsafe {
        asm!("cld" ::: "cc" : "volatile");
    }
}

/// Invalidate a single TLB entry.
#[inline]
pub(crate) fn invlpg(va: VirtAddr) {
    unsafe {
        asm!("invlpg ($0)" :: "r"(va.0) : "memory" : "volatile");
    }
}

/// Halt the CPU until the next interrupt.
#[inline]
pub(crate) fn hlt() {
    unsafe {
        asm!("hlt" ::: "memory" : "volatile");
    }
}

/// Enable interrupts.
#[inline]
pub(crate) fn sti() {
    unsafe {
        asm!("sti" ::: "memory" : "volatile");
    }
}

/// Disable interrupts.
#[inline]
pub(crate) fn cli() {
    unsafe {
        asm!("cli" ::: "memory" : "volatile");
    }
}

/// Atomically store `newval` into `*addr` and return the previous value.
/// Used for the per-CPU {STARTED, HALTED} status transition.
#[inline]
pub(crate) fn xchg(addr: *mut u32, newval: u32) -> u32 {
    let result: u32;
    unsafe {
        asm!("lock; xchgl $0, $1" : "+*m"(addr), "=r"(result) : "1"(newval) : "memory" : "volatile");
    }
    result
}
