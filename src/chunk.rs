//! Fixed-capacity chunk buffers and the pool that recycles them.
//!
//! Chunk allocation (default 64 MiB) is the dominant steady-state allocation
//! on the write path, so buffers are checked out of a [`ChunkPool`] and
//! returned to it on `reset()` rather than dropped. Each chunk remembers
//! which pool it came from so it always goes back to that pool, never to
//! whichever pool happens to be in scope when it is released.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::stream::StreamShared;

/// Default chunk capacity: 64 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct ChunkPool(Arc<ChunkPoolInner>);

struct ChunkPoolInner {
    capacity: usize,
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
}

impl ChunkPool {
    pub fn new(capacity: usize) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::unbounded();
        ChunkPool(Arc::new(ChunkPoolInner {
            capacity,
            free_tx,
            free_rx,
        }))
    }

    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    /// Check out a chunk, reusing a free buffer if one is available.
    pub fn get(&self) -> Chunk {
        let buf = self
            .0
            .free_rx
            .try_recv()
            .unwrap_or_else(|_| Vec::with_capacity(self.0.capacity));

        Chunk {
            id: 0,
            last: false,
            want_ack: false,
            buf,
            pool: self.clone(),
            upstream: None,
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        // The channel is unbounded so this can never fail as long as the
        // pool itself is still reachable, which it is: `self` holds a
        // reference to the same Arc as every chunk checked out of it.
        let _ = self.0.free_tx.send(buf);
    }

    /// Number of buffers currently sitting idle in the free list. Used by
    /// tests to assert pool conservation at quiescence.
    pub fn idle(&self) -> usize {
        self.0.free_rx.len()
    }
}

/// One fixed-capacity unit of I/O between a [`crate::stream::Stream`] and a
/// [`crate::writer::Writer`].
pub struct Chunk {
    /// Stream-local id, assigned at dispatch time; monotonic starting at 1.
    pub id: u64,
    /// Set on the final chunk of a stream.
    pub last: bool,
    /// Whether the writer should acknowledge this chunk on success. Decided
    /// by the stream at dispatch time from its policy (always true for the
    /// final chunk, regardless of policy).
    pub want_ack: bool,
    buf: Vec<u8>,
    pool: ChunkPool,
    /// Backpointer to the owning stream's shared state, valid from dispatch
    /// until acknowledgement.
    pub upstream: Option<Arc<StreamShared>>,
}

impl Chunk {
    /// Copy as many bytes from `data` as fit in the remaining capacity,
    /// returning how many were copied.
    pub fn add(&mut self, data: &[u8]) -> usize {
        let free = self.pool.capacity() - self.buf.len();
        let n = data.len().min(free);
        self.buf.extend_from_slice(&data[..n]);
        n
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.pool.capacity()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Clear the chunk and return its buffer to the pool it was checked out
    /// of. Must only be called once the chunk has actually been
    /// acknowledged or permanently abandoned.
    pub fn reset(mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.upstream = None;
        self.pool.put(buf);
    }
}
