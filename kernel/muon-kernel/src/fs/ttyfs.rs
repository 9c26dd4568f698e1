//! TTY filesystem: the console character device.
//!
//! One input and one output ring of 4096 bytes per instance. Reads block
//! on the event bus until the requested byte count has accumulated; each
//! consumed byte is echoed through the console hook. Line editing is
//! defined explicitly: a backspace keystroke is accepted only while the
//! pending (unread) input is non-empty, and erases exactly one pending
//! byte. Writes render straight to the console and reset the pending
//! input.
//!
//! The console itself (framebuffer terminal) is an external collaborator
//! registered through [`set_console_writer`].

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicPtr, Ordering};

use muon_core::sync::IrqSpinLock;

use crate::config::TTY_BUFFER_SIZE;

use super::{FileSystem, FsError, NodeIdent, NodeType};

/// Console output hook signature.
pub type ConsoleWriter = fn(&[u8]);

fn discard_console(_bytes: &[u8]) {}

static CONSOLE: AtomicPtr<()> = AtomicPtr::new(discard_console as *mut ());

/// Registers the console renderer the TTY echoes and writes through.
pub fn set_console_writer(writer: ConsoleWriter) {
    CONSOLE.store(writer as *mut (), Ordering::Release);
}

fn console_write(bytes: &[u8]) {
    let ptr = CONSOLE.load(Ordering::Acquire);
    // SAFETY: Only ConsoleWriter fns are stored in CONSOLE.
    let writer: ConsoleWriter = unsafe { core::mem::transmute(ptr) };
    writer(bytes);
}

/// Pending-input ring with the backspace rule applied at insertion.
pub struct TtyRing {
    buf: [u8; TTY_BUFFER_SIZE],
    read_pos: usize,
    len: usize,
}

impl TtyRing {
    /// Empty ring.
    pub const fn new() -> Self {
        Self {
            buf: [0; TTY_BUFFER_SIZE],
            read_pos: 0,
            len: 0,
        }
    }

    /// Bytes available to read.
    pub fn pending(&self) -> usize {
        self.len
    }

    /// Applies one keystroke: backspace erases the most recent pending
    /// byte (and is dropped on empty input), anything else is appended.
    /// Returns whether the ring changed.
    pub fn push_key(&mut self, key: u8) -> bool {
        if key == b'\x08' {
            if self.len == 0 {
                return false;
            }
            self.len -= 1;
            return true;
        }
        if self.len >= TTY_BUFFER_SIZE {
            return false;
        }
        self.buf[(self.read_pos + self.len) % TTY_BUFFER_SIZE] = key;
        self.len += 1;
        true
    }

    /// Drains up to `out.len()` bytes.
    pub fn drain(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        for (i, byte) in out.iter_mut().take(n).enumerate() {
            *byte = self.buf[(self.read_pos + i) % TTY_BUFFER_SIZE];
        }
        self.read_pos = (self.read_pos + n) % TTY_BUFFER_SIZE;
        self.len -= n;
        n
    }

    /// Discards everything pending.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.len = 0;
    }
}

impl Default for TtyRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-instance TTY state.
pub struct TtyNode {
    input: IrqSpinLock<TtyRing>,
}

impl TtyNode {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            input: IrqSpinLock::new(TtyRing::new()),
        })
    }
}

/// The TTY filesystem.
pub struct TtyFs;

impl TtyFs {
    /// Creates the filesystem singleton.
    pub fn new() -> Self {
        Self
    }
}

impl Default for TtyFs {
    fn default() -> Self {
        Self::new()
    }
}

fn node(ident: &NodeIdent) -> Result<&TtyNode, FsError> {
    ident.downcast_ref::<TtyNode>().ok_or(FsError::Invalid)
}

impl FileSystem for TtyFs {
    fn name(&self) -> &'static str {
        "ttyfs"
    }

    fn mount(&self, _device: Option<NodeIdent>) -> Result<NodeIdent, FsError> {
        Ok(TtyNode::new())
    }

    fn mknode(
        &self,
        _parent: &NodeIdent,
        _name: &str,
        _kind: NodeType,
    ) -> Result<NodeIdent, FsError> {
        Ok(TtyNode::new())
    }

    /// Blocks until `buf.len()` bytes of input have accumulated, then
    /// drains and echoes them. The offset is ignored; a TTY has no
    /// positions.
    fn read(&self, ident: &NodeIdent, _offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let tty = node(ident)?;
        loop {
            {
                let mut input = tty.input.lock();
                if input.pending() >= buf.len() {
                    let n = input.drain(buf);
                    drop(input);
                    console_write(&buf[..n]);
                    return Ok(n);
                }
            }
            // Not enough input yet: wait for the next keystroke. The ring
            // lock is released while parked.
            let key = wait_for_key();
            if key == 0 {
                return Err(FsError::WouldBlock);
            }
            tty.input.lock().push_key(key as u8);
        }
    }

    /// Renders to the console and resets the pending input.
    fn write(&self, ident: &NodeIdent, _offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        node(ident)?.input.lock().reset();
        console_write(buf);
        Ok(buf.len())
    }
}

/// Parks the caller until a KeyPressed event arrives, returning its
/// parameter.
#[cfg(target_os = "none")]
fn wait_for_key() -> u64 {
    crate::sched::wait_event(crate::sched::eventbus::EventKind::KeyPressed)
}

/// Host builds cannot block; the read path reports WouldBlock instead.
#[cfg(not(target_os = "none"))]
fn wait_for_key() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backspace_only_with_pending_input() {
        let mut ring = TtyRing::new();
        // Backspace on an empty ring is dropped.
        assert!(!ring.push_key(b'\x08'));
        assert_eq!(ring.pending(), 0);

        ring.push_key(b'h');
        ring.push_key(b'j');
        assert!(ring.push_key(b'\x08'));
        ring.push_key(b'i');
        assert_eq!(ring.pending(), 2);

        let mut out = [0u8; 2];
        assert_eq!(ring.drain(&mut out), 2);
        assert_eq!(&out, b"hi");
    }

    #[test]
    fn drain_is_fifo_across_wraparound() {
        let mut ring = TtyRing::new();
        for _ in 0..3 {
            for byte in 0..200u8 {
                ring.push_key(byte);
            }
            let mut out = [0u8; 200];
            assert_eq!(ring.drain(&mut out), 200);
            assert_eq!(out[0], 0);
            assert_eq!(out[199], 199);
        }
    }

    #[test]
    fn ring_caps_at_buffer_size() {
        let mut ring = TtyRing::new();
        for _ in 0..TTY_BUFFER_SIZE + 10 {
            ring.push_key(b'x');
        }
        assert_eq!(ring.pending(), TTY_BUFFER_SIZE);
    }

    #[test]
    fn write_resets_pending_input() {
        let fs = TtyFs::new();
        let ident = fs.mount(None).unwrap();
        let tty = node(&ident).unwrap();
        tty.input.lock().push_key(b'q');
        fs.write(&ident, 0, b"prompt> ").unwrap();
        assert_eq!(tty.input.lock().pending(), 0);
    }

    #[test]
    fn host_read_reports_wouldblock_when_starved() {
        let fs = TtyFs::new();
        let ident = fs.mount(None).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(&ident, 0, &mut buf).unwrap_err(), FsError::WouldBlock);
    }

    #[test]
    fn read_returns_echoed_bytes_when_available() {
        let fs = TtyFs::new();
        let ident = fs.mount(None).unwrap();
        let tty = node(&ident).unwrap();
        for b in b"ok\n" {
            tty.input.lock().push_key(*b);
        }
        let mut buf = [0u8; 3];
        assert_eq!(fs.read(&ident, 0, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"ok\n");
    }
}
