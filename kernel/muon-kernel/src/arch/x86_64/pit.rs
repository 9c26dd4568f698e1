//! 8254 PIT fallback waits.
//!
//! Used only when no HPET is present: channel 0 is programmed one-shot per
//! millisecond and polled through the read-back of the output latch.

use super::instructions::{inb, outb};

const CH0_DATA: u16 = 0x40;
const MODE_CMD: u16 = 0x43;

/// PIT input frequency in Hz.
const PIT_HZ: u64 = 1_193_182;

/// Busy-waits roughly `ms` milliseconds using channel 0 one-shots.
pub fn wait_ms(ms: u64) {
    for _ in 0..ms {
        // Channel 0, lobyte/hibyte, mode 0 (interrupt on terminal count).
        outb(MODE_CMD, 0x30);
        let reload = (PIT_HZ / 1000) as u16;
        outb(CH0_DATA, reload as u8);
        outb(CH0_DATA, (reload >> 8) as u8);
        loop {
            // Read-back command, latch status of channel 0.
            outb(MODE_CMD, 0xE2);
            if inb(CH0_DATA) & 0x80 != 0 {
                break;
            }
            core::hint::spin_loop();
        }
    }
}
