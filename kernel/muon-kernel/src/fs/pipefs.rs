//! Anonymous pipe filesystem.
//!
//! One 4096-byte ring per pipe node. Reads drain whatever is buffered and
//! return 0 when empty (non-blocking); writes enqueue up to the remaining
//! capacity and report how much fit.

extern crate alloc;

use alloc::sync::Arc;

use muon_core::sync::SpinLock;

use crate::config::PIPE_BUFFER_SIZE;

use super::{FileSystem, FsError, NodeIdent, NodeType};

struct PipeRing {
    buf: [u8; PIPE_BUFFER_SIZE],
    read_pos: usize,
    len: usize,
}

impl PipeRing {
    const fn new() -> Self {
        Self {
            buf: [0; PIPE_BUFFER_SIZE],
            read_pos: 0,
            len: 0,
        }
    }

    fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        for (i, byte) in out.iter_mut().take(n).enumerate() {
            *byte = self.buf[(self.read_pos + i) % PIPE_BUFFER_SIZE];
        }
        self.read_pos = (self.read_pos + n) % PIPE_BUFFER_SIZE;
        self.len -= n;
        n
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(PIPE_BUFFER_SIZE - self.len);
        for (i, &byte) in data.iter().take(n).enumerate() {
            self.buf[(self.read_pos + self.len + i) % PIPE_BUFFER_SIZE] = byte;
        }
        self.len += n;
        n
    }
}

/// Per-pipe state.
pub struct PipeNode {
    ring: SpinLock<PipeRing>,
}

impl PipeNode {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ring: SpinLock::new(PipeRing::new()),
        })
    }
}

/// The pipe filesystem.
pub struct PipeFs;

impl PipeFs {
    /// Creates the filesystem singleton.
    pub fn new() -> Self {
        Self
    }
}

impl Default for PipeFs {
    fn default() -> Self {
        Self::new()
    }
}

fn node(ident: &NodeIdent) -> Result<&PipeNode, FsError> {
    ident.downcast_ref::<PipeNode>().ok_or(FsError::Invalid)
}

impl FileSystem for PipeFs {
    fn name(&self) -> &'static str {
        "pipefs"
    }

    fn mount(&self, _device: Option<NodeIdent>) -> Result<NodeIdent, FsError> {
        Ok(PipeNode::new())
    }

    fn mknode(
        &self,
        _parent: &NodeIdent,
        _name: &str,
        _kind: NodeType,
    ) -> Result<NodeIdent, FsError> {
        Ok(PipeNode::new())
    }

    fn read(&self, ident: &NodeIdent, _offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        Ok(node(ident)?.ring.lock().read(buf))
    }

    fn write(&self, ident: &NodeIdent, _offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        Ok(node(ident)?.ring.lock().write(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (PipeFs, NodeIdent) {
        let fs = PipeFs::new();
        let ident = fs.mount(None).unwrap();
        (fs, ident)
    }

    #[test]
    fn fifo_order() {
        let (fs, ident) = pipe();
        assert_eq!(fs.write(&ident, 0, b"abc").unwrap(), 3);
        assert_eq!(fs.write(&ident, 0, b"def").unwrap(), 3);
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(&ident, 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        let mut rest = [0u8; 8];
        assert_eq!(fs.read(&ident, 0, &mut rest).unwrap(), 2);
        assert_eq!(&rest[..2], b"ef");
    }

    #[test]
    fn empty_read_returns_zero() {
        let (fs, ident) = pipe();
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(&ident, 0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn writes_clamp_to_capacity() {
        let (fs, ident) = pipe();
        let big = vec![7u8; PIPE_BUFFER_SIZE + 100];
        assert_eq!(fs.write(&ident, 0, &big).unwrap(), PIPE_BUFFER_SIZE);
        assert_eq!(fs.write(&ident, 0, b"x").unwrap(), 0);
        let mut buf = vec![0u8; 10];
        assert_eq!(fs.read(&ident, 0, &mut buf).unwrap(), 10);
        // Space freed by the read becomes writable again.
        assert_eq!(fs.write(&ident, 0, b"0123456789AB").unwrap(), 10);
    }

    #[test]
    fn wraparound_preserves_bytes() {
        let (fs, ident) = pipe();
        let fill = vec![1u8; PIPE_BUFFER_SIZE - 2];
        fs.write(&ident, 0, &fill).unwrap();
        let mut sink = vec![0u8; PIPE_BUFFER_SIZE - 4];
        fs.read(&ident, 0, &mut sink).unwrap();
        // Now read_pos is near the end; this write wraps.
        fs.write(&ident, 0, b"wrap!").unwrap();
        let mut out = [0u8; 7];
        assert_eq!(fs.read(&ident, 0, &mut out).unwrap(), 7);
        assert_eq!(&out[2..], b"wrap!");
    }
}
