//! x86-64 platform: descriptor tables, interrupt plumbing, timers, SMP.

pub mod apic;
pub mod gdt;
pub mod hpet;
pub mod idt;
pub mod instructions;
pub mod isr;
pub mod pic;
pub mod pit;
pub mod smp;
pub mod syscall;
