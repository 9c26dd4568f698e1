//! The real-mode → long-mode AP trampoline blob.
//!
//! Assembled into the kernel image and copied to physical 0x70000 at SMP
//! init. Absolute references are computed as `0x70000 + (label - start)`
//! because the blob does not execute from its link address. The argument
//! area the BSP fills sits at 0x70F00 (see the offsets in `super`).
//!
//! Stages:
//! 1. 16-bit: load a flat 32-bit GDT, set CR0.PE, far-jump to stage 2.
//! 2. 32-bit: enable PAE, load the kernel CR3 from the argument area,
//!    set EFER.LME and CR0.PG, load the 64-bit GDT entries, far-jump.
//! 3. 64-bit: load the kernel IDT image, pick up the stack and argument,
//!    bump the boot counter and jump to the Rust entry point.

use core::arch::global_asm;

global_asm!(
    r#"
.section .rodata
.global muon_trampoline_start
.global muon_trampoline_end
.set TRAMP, 0x70000

muon_trampoline_start:
.code16
    cli
    cld
    # The STARTUP vector put us at CS = TRAMP >> 4, IP = 0. Real-mode
    # displacements are 16-bit, so the descriptor is addressed through DS
    # with a blob-relative offset; its stored base is still linear.
    mov ax, cs
    mov ds, ax
    lgdt [tramp_gdtr - muon_trampoline_start]
    mov eax, cr0
    or al, 1
    mov cr0, eax
    # Far jump into protected mode (0x66 prefix for the 32-bit offset).
    .byte 0x66, 0xEA
    .long TRAMP + (tramp_pm32 - muon_trampoline_start)
    .word 0x08

.code32
tramp_pm32:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax

    # PAE
    mov eax, cr4
    or eax, 1 << 5
    mov cr4, eax

    # Kernel CR3 from the argument area.
    mov eax, [TRAMP + 0xF00]
    mov cr3, eax

    # EFER.LME
    mov ecx, 0xC0000080
    rdmsr
    or eax, 1 << 8
    wrmsr

    # Paging + protection on: next fetch must go through the far jump.
    mov eax, cr0
    or eax, 0x80000001
    mov cr0, eax

    .byte 0xEA
    .long TRAMP + (tramp_lm64 - muon_trampoline_start)
    .word 0x18

.code64
tramp_lm64:
    mov ax, 0x20
    mov ds, ax
    mov es, ax
    mov ss, ax

    lidt [TRAMP + 0xF08]
    mov rsp, [TRAMP + 0xF20]
    lock inc dword ptr [TRAMP + 0xF30]
    mov rdi, [TRAMP + 0xF28]
    mov rax, [TRAMP + 0xF18]
    jmp rax

# Flat GDT used only inside the trampoline:
#   0x08 code32, 0x10 data32, 0x18 code64, 0x20 data64.
.balign 8
tramp_gdt:
    .quad 0
    .quad 0x00CF9A000000FFFF
    .quad 0x00CF92000000FFFF
    .quad 0x00AF9A000000FFFF
    .quad 0x00CF92000000FFFF
tramp_gdtr:
    .word (tramp_gdtr - tramp_gdt) - 1
    .long TRAMP + (tramp_gdt - muon_trampoline_start)
muon_trampoline_end:
"#
);

unsafe extern "C" {
    static muon_trampoline_start: u8;
    static muon_trampoline_end: u8;
}

/// The assembled blob bytes.
pub fn blob() -> &'static [u8] {
    // SAFETY: The two symbols delimit the contiguous blob emitted by the
    // global_asm block above.
    unsafe {
        let start = core::ptr::addr_of!(muon_trampoline_start);
        let end = core::ptr::addr_of!(muon_trampoline_end);
        core::slice::from_raw_parts(start, end.offset_from(start) as usize)
    }
}
