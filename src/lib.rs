#![no_std]
#![feature(asm)]
#![feature(const_fn)]
#![feature(naked_functions)]

extern crate alloc;

pub mod console;

pub mod allocator;
pub mod constants;
pub mod elf;
pub mod env;
pub mod gdt;
pub mod kbd;
pub mod kclock;
pub mod kernel_lock;
pub mod lapic;
pub mod mp;
pub mod mpconfig;
pub mod once;
pub mod picirq;
pub mod pmap;
pub mod rwlock;
pub mod sched;
pub mod serial;
pub mod spinlock;
pub mod syscall;
pub mod trap;
pub mod upcall;
pub mod user;
pub mod util;
pub mod vga_buffer;
pub mod volatile;
pub mod x86;

use constants::{KHEAP_BASE, KHEAP_SIZE};
use core::panic::PanicInfo;
use vga_buffer::Buffer;

#[global_allocator]
static ALLOCATOR: allocator::HeapAllocator = allocator::HeapAllocator;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    trap::mark_panicked();
    println!("{}", info);
    loop {
        x86::hlt();
    }
}

/// Entered once, by the bootstrap processor, before any application
/// processor is woken up. Brings the machine from real-mode handoff to a
/// point where the scheduler can take over.
#[no_mangle]
pub fn lib_main() {
    let vga_buffer = unsafe { &mut *(0xb8000 as *mut Buffer) };
    vga_buffer::init_writer(vga_buffer);

    println!("ringkernel booting on BSP");

    pmap::mem_init();

    // GDT must be loaded before anything below touches a TSS/segment
    // selector; it does not itself need mpconfig::this_cpu().
    gdt::init_percpu();

    // mp_init() populates the CPU table; lapic_init() then brings up this
    // CPU's local APIC, which is what mpconfig::this_cpu() reads its id
    // from. Both must run before trap_init(), whose percpu half needs
    // this_cpu_mut() to install this CPU's TSS.
    unsafe {
        mpconfig::mp_init();
    }
    lapic::lapic_init();

    unsafe {
        trap::trap_init();
    }

    picirq::pic_init();
    kbd::kbd_init();

    unsafe {
        allocator::HeapAllocator::init(KHEAP_BASE as usize, KHEAP_SIZE);
    }

    env::init();
    {
        let mut table = env::env_table();
        env::env_create_for_init(&mut *table);
        table.sync_env_info();
    }

    mp::boot_aps();

    println!("ringkernel ready, starting scheduler");
    sched::sched_yield();
}
