//! Kernel panic handler.
//!
//! Prints the panic message and a symbolised stack walk, then parks the
//! CPU. Exceptions funnel here via `panic!` in their handlers, so the
//! first walked frame is the exception dispatcher itself.

use core::panic::PanicInfo;

use muon_core::kprintln;

use crate::arch::x86_64::instructions::{cli, hlt};

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    cli();
    kprintln!();
    kprintln!("KERNEL PANIC: {}", info.message());
    if let Some(location) = info.location() {
        kprintln!("  at {}:{}", location.file(), location.line());
    }
    crate::backtrace::print_stack_walk();
    loop {
        hlt();
    }
}
