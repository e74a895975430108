use bytes::{Bytes, BytesMut};
use std::sync::Mutex;

const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1024;
const MAX_POOLED_CAPACITY: usize = 64 * 1024;

/// Read/write byte buffer backed by `BytesMut`. Chunks split off the front
/// are ref-counted `Bytes`, so decoded frames keep their payload alive
/// without copying while the buffer continues to accumulate reads.
#[derive(Debug, Default)]
pub struct IoBuffer {
    data: BytesMut,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        IoBuffer {
            data: BytesMut::with_capacity(capacity),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        IoBuffer {
            data: BytesMut::from(data),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Splits off and returns the first `n` bytes. Panics if `n > len`,
    /// callers check via `len()` first.
    pub fn drain_to(&mut self, n: usize) -> Bytes {
        self.data.split_to(n).freeze()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn as_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    pub fn into_inner(self) -> BytesMut {
        self.data
    }
}

/// Free-list of read buffers shared by the connections of one runtime.
/// Oversized buffers are dropped instead of being returned so a single
/// large frame does not pin its allocation forever.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool::default()
    }

    pub fn acquire(&self) -> IoBuffer {
        let mut free = self.free.lock().unwrap();
        match free.pop() {
            Some(data) => IoBuffer { data },
            None => IoBuffer::new(),
        }
    }

    pub fn release(&self, buf: IoBuffer) {
        let mut data = buf.data;
        if data.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        data.clear();
        self.free.lock().unwrap().push(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_leaves_remainder() {
        let mut buf = IoBuffer::new();
        buf.append(b"hello world");
        let head = buf.drain_to(5);
        assert_eq!(&head[..], b"hello");
        assert_eq!(buf.bytes(), b" world");
    }

    #[test]
    fn pool_reuses_buffers() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        buf.append(b"abc");
        pool.release(buf);
        let buf = pool.acquire();
        assert!(buf.is_empty());
    }
}
