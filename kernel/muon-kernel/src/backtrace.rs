//! Panic-path stack walking.
//!
//! Walks the saved-RBP chain and symbolises frames against a sorted
//! `(address, name)` table injected at boot. Without a table the raw
//! return addresses are still printed.

use core::sync::atomic::{AtomicUsize, Ordering};

use muon_core::kprintln;

/// One symbol: start address and name.
pub type Symbol = (u64, &'static str);

static SYMBOLS: &[Symbol] = &[];
static SYMBOLS_PTR: AtomicUsize = AtomicUsize::new(0);
static SYMBOLS_LEN: AtomicUsize = AtomicUsize::new(0);

/// Installs the kernel symbol table (sorted by address ascending).
pub fn init(symbols: &'static [Symbol]) {
    SYMBOLS_PTR.store(symbols.as_ptr() as usize, Ordering::Release);
    SYMBOLS_LEN.store(symbols.len(), Ordering::Release);
}

fn symbols() -> &'static [Symbol] {
    let ptr = SYMBOLS_PTR.load(Ordering::Acquire);
    let len = SYMBOLS_LEN.load(Ordering::Acquire);
    if ptr == 0 {
        return SYMBOLS;
    }
    // SAFETY: init() stored a 'static slice.
    unsafe { core::slice::from_raw_parts(ptr as *const Symbol, len) }
}

/// Resolves an address to the nearest preceding symbol.
fn resolve(addr: u64) -> Option<(&'static str, u64)> {
    let table = symbols();
    let idx = table.partition_point(|&(start, _)| start <= addr);
    if idx == 0 {
        return None;
    }
    let (start, name) = table[idx - 1];
    Some((name, addr - start))
}

/// Maximum frames printed before assuming a corrupt chain.
const MAX_FRAMES: usize = 32;

/// Prints the call chain starting from the current frame.
///
/// Frame pointers are trusted only while they stay in higher-half memory
/// and increase monotonically; anything else ends the walk.
pub fn print_stack_walk() {
    let mut rbp: u64;
    // SAFETY: Reading RBP has no side effects.
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
    }

    kprintln!("stack backtrace:");
    for frame in 0..MAX_FRAMES {
        if rbp < crate::config::HHDM_BASE || rbp & 7 != 0 {
            break;
        }
        // SAFETY: rbp passed the higher-half and alignment checks; a saved
        // frame is [saved_rbp, return_addr].
        let (next_rbp, ret) = unsafe {
            let p = rbp as *const u64;
            (*p, *p.add(1))
        };
        if ret == 0 {
            break;
        }
        match resolve(ret) {
            Some((name, offset)) => {
                kprintln!("  {:2}: {:#018x} {}+{:#x}", frame, ret, name, offset);
            }
            None => kprintln!("  {:2}: {:#018x}", frame, ret),
        }
        if next_rbp <= rbp {
            break;
        }
        rbp = next_rbp;
    }
}
