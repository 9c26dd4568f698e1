//! In-tree drivers. Only the COM1 UART lives here; disk, keyboard and
//! framebuffer drivers are external collaborators wired in through the
//! interrupt registry, the event bus, the block-device seam and the
//! console hook.

pub mod serial;
