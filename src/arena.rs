use bytes::{Bytes, BytesMut};

const DEFAULT_CHUNK_SIZE: usize = 4 * 1024;

/// Per-request bump allocator.
///
/// Allocations copy into the current chunk and hand back a refcounted
/// [`Bytes`] view of the written span. Dropping the arena releases the
/// chunks it still owns in one operation; spans that were handed out keep
/// their backing chunk alive on their own, so response bytes queued on an
/// output channel stay valid after the request that produced them is
/// released.
///
/// A request owns exactly one arena from `handle_next_request` until
/// `done_with_current_request`.
#[derive(Debug)]
pub struct RequestArena {
    chunk: BytesMut,
    chunk_size: usize,
    allocated: usize,
}

impl RequestArena {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk: BytesMut::new(),
            chunk_size: chunk_size.max(64),
            allocated: 0,
        }
    }

    /// Copy `data` into the arena and return a shared view of it.
    pub fn alloc(&mut self, data: &[u8]) -> Bytes {
        debug_assert_eq!(self.chunk.len(), 0);
        if self.chunk.capacity() < data.len() {
            // leftover of the previous chunk is dropped; spans already
            // handed out keep it alive through their own refcount
            self.chunk = BytesMut::with_capacity(self.chunk_size.max(data.len()));
        }
        self.chunk.extend_from_slice(data);
        self.allocated += data.len();
        self.chunk.split().freeze()
    }

    /// Copy a string into the arena.
    #[inline]
    pub fn alloc_str(&mut self, data: &str) -> Bytes {
        self.alloc(data.as_bytes())
    }

    /// Total bytes handed out over the arena's lifetime.
    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.allocated
    }
}

impl Default for RequestArena {
    fn default() -> Self {
        Self::new()
    }
}
