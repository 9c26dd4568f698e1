//! Exception handlers and hardware interrupt dispatch.
//!
//! Exceptions panic with their architectural name and error code; the panic
//! path walks the RBP chain, so the first reported frame is the dispatcher
//! itself. Hardware IRQs route through a registry of per-vector handlers;
//! the dispatcher sends the legacy PIC EOI (slave included for vectors
//! >= 40) and drops the spurious IRQ7 silently.

use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use super::pic;

/// Saved CPU state pushed by the hardware on interrupt entry.
#[derive(Debug)]
#[repr(C)]
pub struct InterruptStackFrame {
    /// Interrupted instruction pointer.
    pub rip: u64,
    /// Interrupted code segment.
    pub cs: u64,
    /// Interrupted RFLAGS.
    pub rflags: u64,
    /// Interrupted stack pointer.
    pub rsp: u64,
    /// Interrupted stack segment.
    pub ss: u64,
}

// ---------------------------------------------------------------------------
// Exceptions
// ---------------------------------------------------------------------------

macro_rules! exception {
    ($name:ident, $text:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
            panic!("EXCEPTION: {}\n{:#x?}", $text, frame);
        }
    };
}

macro_rules! exception_err {
    ($name:ident, $text:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame, error_code: u64) {
            panic!(
                "EXCEPTION: {} (error_code={:#x})\n{:#x?}",
                $text, error_code, frame
            );
        }
    };
}

exception!(divide_error, "Division by zero");
exception!(debug_trap, "Debug");
exception!(nmi, "Non-maskable interrupt");
exception!(breakpoint, "Breakpoint");
exception!(overflow, "Overflow");
exception!(bound_range, "Bound range exceeded");
exception!(invalid_opcode, "Invalid opcode");
exception!(device_not_available, "Device not available");
exception_err!(double_fault, "Double fault");
exception!(coprocessor_overrun, "Coprocessor segment overrun");
exception_err!(invalid_tss, "Invalid TSS");
exception_err!(segment_not_present, "Segment not present");
exception_err!(stack_segment_fault, "Stack segment fault");
exception_err!(general_protection, "General protection fault");
exception!(x87_floating_point, "x87 floating point");
exception_err!(alignment_check, "Alignment check");
exception!(machine_check, "Machine check");
exception!(simd_floating_point, "SIMD floating point");
exception!(virtualization, "Virtualization");
exception_err!(security_exception, "Security exception");

extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, error_code: u64) {
    let cr2 = super::instructions::read_cr2();
    let cause = if error_code & 1 != 0 {
        "protection violation"
    } else {
        "page not present"
    };
    let access = if error_code & 16 != 0 {
        "instruction fetch"
    } else if error_code & 2 != 0 {
        "write"
    } else {
        "read"
    };
    let mode = if error_code & 4 != 0 { "user" } else { "kernel" };
    panic!(
        "EXCEPTION: Page fault ({cause} during {mode} {access})\n  \
         Address: {cr2:#x}\n  Error: {error_code:#x}\n{frame:#x?}"
    );
}

/// Static exception gate assignments: vectors 0..=20 plus 30.
pub fn exception_stubs() -> [(u8, u64); 22] {
    [
        (0, divide_error as usize as u64),
        (1, debug_trap as usize as u64),
        (2, nmi as usize as u64),
        (3, breakpoint as usize as u64),
        (4, overflow as usize as u64),
        (5, bound_range as usize as u64),
        (6, invalid_opcode as usize as u64),
        (7, device_not_available as usize as u64),
        (8, double_fault as usize as u64),
        (9, coprocessor_overrun as usize as u64),
        (10, invalid_tss as usize as u64),
        (11, segment_not_present as usize as u64),
        (12, stack_segment_fault as usize as u64),
        (13, general_protection as usize as u64),
        (14, page_fault as usize as u64),
        (16, x87_floating_point as usize as u64),
        (17, alignment_check as usize as u64),
        (18, machine_check as usize as u64),
        (19, simd_floating_point as usize as u64),
        (20, virtualization as usize as u64),
        (30, security_exception as usize as u64),
        (15, reserved_exception as usize as u64),
    ]
}

extern "x86-interrupt" fn reserved_exception(frame: InterruptStackFrame) {
    panic!("EXCEPTION: Reserved\n{:#x?}", frame);
}

// ---------------------------------------------------------------------------
// Hardware interrupt registry
// ---------------------------------------------------------------------------

/// Handler signature: receives the vector that fired.
pub type IrqHandler = fn(u8);

/// Number of registrable vectors (32..=255).
const NUM_VECTORS: usize = 224;

static HANDLERS: [AtomicPtr<()>; NUM_VECTORS] = {
    const NONE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
    [NONE; NUM_VECTORS]
};

/// Registration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptError {
    /// Vector outside 32..=255.
    InvalidVector,
    /// Another handler already owns this vector.
    AlreadyRegistered,
    /// The dynamic vector counter is exhausted.
    VectorExhausted,
}

/// Registers `handler` for `vector`.
pub fn register_handler(vector: u8, handler: IrqHandler) -> Result<(), InterruptError> {
    if vector < 32 {
        return Err(InterruptError::InvalidVector);
    }
    let slot = &HANDLERS[(vector - 32) as usize];
    slot.compare_exchange(
        core::ptr::null_mut(),
        handler as *mut (),
        Ordering::AcqRel,
        Ordering::Acquire,
    )
    .map(|_| ())
    .map_err(|_| InterruptError::AlreadyRegistered)
}

/// Monotonic dynamic vector counter, starting just past the syscall gate.
static NEXT_VECTOR: AtomicU8 = AtomicU8::new(0x81);

/// Hands out the next free dynamic vector.
pub fn alloc_vector() -> Result<u8, InterruptError> {
    let v = NEXT_VECTOR.fetch_add(1, Ordering::Relaxed);
    if v == u8::MAX {
        NEXT_VECTOR.store(u8::MAX, Ordering::Relaxed);
        return Err(InterruptError::VectorExhausted);
    }
    Ok(v)
}

/// Spurious vector of the master PIC (IRQ7).
const SPURIOUS_IRQ7: u8 = 39;

/// Common dispatch for registry-driven vectors.
fn dispatch(vector: u8) {
    if vector == SPURIOUS_IRQ7 {
        return;
    }
    let ptr = HANDLERS[(vector - 32) as usize].load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: Only IrqHandler fns are stored via register_handler.
        let handler: IrqHandler = unsafe { core::mem::transmute(ptr) };
        handler(vector);
    }
    if (32..=47).contains(&vector) {
        pic::send_eoi(vector);
    }
}

macro_rules! irq_stub {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            dispatch($vector);
        }
    };
}

irq_stub!(irq_32, 32);
irq_stub!(irq_33, 33);
irq_stub!(irq_34, 34);
irq_stub!(irq_35, 35);
irq_stub!(irq_36, 36);
irq_stub!(irq_37, 37);
irq_stub!(irq_38, 38);
irq_stub!(irq_39, 39);
irq_stub!(irq_40, 40);
irq_stub!(irq_41, 41);
irq_stub!(irq_42, 42);
irq_stub!(irq_43, 43);
irq_stub!(irq_44, 44);

/// Static ISA IRQ gate assignments: vectors 32..=44.
pub fn irq_stubs() -> [(u8, u64); 13] {
    [
        (32, irq_32 as usize as u64),
        (33, irq_33 as usize as u64),
        (34, irq_34 as usize as u64),
        (35, irq_35 as usize as u64),
        (36, irq_36 as usize as u64),
        (37, irq_37 as usize as u64),
        (38, irq_38 as usize as u64),
        (39, irq_39 as usize as u64),
        (40, irq_40 as usize as u64),
        (41, irq_41 as usize as u64),
        (42, irq_42 as usize as u64),
        (43, irq_43 as usize as u64),
        (44, irq_44 as usize as u64),
    ]
}
