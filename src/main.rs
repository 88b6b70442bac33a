#![no_std]
#![no_main]

use ringkernel::lib_main;

/// Entry point jumped to by the bootstrap assembly once it has switched
/// the BSP into protected mode and set up a stack.
#[no_mangle]
pub extern "C" fn i386_init() -> ! {
    lib_main();
    unreachable!("lib_main should not return: sched_yield never returns");
}
