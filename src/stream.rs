//! Client-facing write object.
//!
//! A `Stream` accumulates bytes into [`Chunk`]s and dispatches full chunks to
//! whichever drive or drive-group it is currently attached to. The
//! destination (`out`) and the close hook live in [`StreamShared`], a small
//! piece of state shared (via `Arc`) with every chunk dispatched from this
//! stream — this is what lets a drive's control loop re-point a live stream
//! during hand-off without going back through the request task that owns
//! the `Stream` itself, which may be blocked waiting for an acknowledgement.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::chunk::{Chunk, ChunkPool};
use crate::error::{RequestError, ShortWrite};
use crate::policy::Policy;

/// One acknowledgement result: `Ok(())` for a successful write, `Err(cause)`
/// for a terminal media error. Out-of-space never reaches here: it is
/// recovered silently by hand-off (see `drive`).
pub type AckResult = Result<(), String>;

/// State shared between a [`Stream`] and every [`Chunk`] it has dispatched.
/// Kept behind an `Arc` so a drive's control loop can repoint `out` and
/// `on_close` during hand-off while the chunk (and the stream's blocked
/// `write` call, if any) still reference the same instance.
pub struct StreamShared {
    pub archive: Arc<str>,
    pub policy: Policy,
    out: Mutex<Sender<Chunk>>,
    errc_tx: Sender<AckResult>,
    errc_rx: Receiver<AckResult>,
    on_close: Mutex<Box<dyn FnMut() + Send>>,
}

impl StreamShared {
    /// Re-point future chunk dispatches at a new drive's ingress channel.
    /// Called only by the acquirer / drive control loop during admission or
    /// hand-off, never concurrently with a dispatch in flight (the drive's
    /// serialized control loop is what guarantees this).
    pub fn set_out(&self, out: Sender<Chunk>) {
        *self.out.lock().unwrap() = out;
    }

    /// Replace the close hook (used when hand-off moves the stream to a
    /// different drive: the old hook released the failed drive, the new one
    /// must release the replacement instead).
    pub fn set_on_close(&self, hook: Box<dyn FnMut() + Send>) {
        *self.on_close.lock().unwrap() = hook;
    }

    /// A clone of the sender a writer uses to acknowledge (or fail) a
    /// dispatched chunk.
    pub fn ack_sender(&self) -> Sender<AckResult> {
        self.errc_tx.clone()
    }

    fn out(&self) -> Sender<Chunk> {
        self.out.lock().unwrap().clone()
    }

    fn run_on_close(&self) {
        (self.on_close.lock().unwrap())();
    }
}

pub struct Stream {
    shared: Arc<StreamShared>,
    partial: Option<Chunk>,
    counter: u64,
    pool: ChunkPool,
    total_written: u64,
}

impl Stream {
    pub fn new(
        archive: impl Into<Arc<str>>,
        policy: Policy,
        pool: ChunkPool,
        out: Sender<Chunk>,
        on_close: Box<dyn FnMut() + Send>,
    ) -> Self {
        let (errc_tx, errc_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(StreamShared {
            archive: archive.into(),
            policy,
            out: Mutex::new(out),
            errc_tx,
            errc_rx,
            on_close: Mutex::new(on_close),
        });

        let partial = Some(pool.get());

        Stream {
            shared,
            partial,
            counter: 0,
            pool,
            total_written: 0,
        }
    }

    pub fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    /// Accumulate `data`, dispatching full chunks as they fill. Returns the
    /// cumulative bytes accepted so far, or a [`crate::error::RequestError::ShortWrite`]
    /// describing how much was durably accepted before a terminal failure.
    pub fn write(&mut self, mut data: &[u8]) -> Result<u64, RequestError> {
        while !data.is_empty() {
            let n = self.partial.as_mut().expect("stream has a partial chunk").add(data);
            data = &data[n..];

            if self.partial.as_ref().unwrap().is_full() {
                self.dispatch(false)?;
                self.partial = Some(self.pool.get());
            }
        }

        Ok(self.total_written)
    }

    /// Flush the partial chunk as the stream's final chunk (always
    /// acknowledged, regardless of policy) and run the close hook.
    pub fn close(mut self) -> Result<(), RequestError> {
        self.partial.as_mut().expect("stream has a partial chunk").last = true;
        let result = self.dispatch(true);
        self.shared.run_on_close();
        result
    }

    fn dispatch(&mut self, force_ack: bool) -> Result<(), RequestError> {
        let mut chunk = self.partial.take().expect("dispatch without a partial chunk");
        self.counter += 1;
        chunk.id = self.counter;
        chunk.upstream = Some(self.shared.clone());
        let len = chunk.len() as u64;
        let want_ack = force_ack || self.shared.policy.acknowledged;
        chunk.want_ack = want_ack;

        self.shared
            .out()
            .send(chunk)
            .map_err(|_| RequestError::Internal(anyhow::anyhow!("drive ingress closed")))?;

        if !want_ack {
            return Ok(());
        }

        match self.shared.errc_rx.recv() {
            Ok(Ok(())) => {
                self.total_written += len;
                Ok(())
            }
            Ok(Err(cause)) => Err(ShortWrite {
                written: self.total_written,
                cause,
            }
            .into()),
            Err(_) => Err(RequestError::Internal(anyhow::anyhow!(
                "stream acknowledgement channel closed"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (Sender<Chunk>, Receiver<Chunk>) {
        crossbeam_channel::unbounded()
    }

    #[test]
    fn small_write_produces_one_partial_chunk() {
        let pool = ChunkPool::new(16);
        let (tx, rx) = sink();
        let mut stream = Stream::new("a", Policy::default(), pool, tx, Box::new(|| {}));
        stream.write(b"hello").unwrap();
        // chunk isn't full, so nothing was dispatched yet
        assert!(rx.try_recv().is_err());
        stream.close().unwrap();
        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.id, 1);
        assert!(chunk.last);
        assert_eq!(chunk.bytes(), b"hello");
    }

    #[test]
    fn full_chunk_dispatches_immediately_and_waits_for_ack() {
        let pool = ChunkPool::new(4);
        let (tx, rx) = sink();
        let mut stream = Stream::new("a", Policy::default(), pool, tx, Box::new(|| {}));

        let ack = stream.shared().ack_sender();
        std::thread::spawn(move || {
            let chunk = rx.recv().unwrap();
            assert_eq!(chunk.bytes(), b"abcd");
            ack.send(Ok(())).unwrap();
        });

        let written = stream.write(b"abcd").unwrap();
        assert_eq!(written, 4);
    }

    #[test]
    fn error_surfaces_as_short_write() {
        let pool = ChunkPool::new(4);
        let (tx, rx) = sink();
        let mut stream = Stream::new("a", Policy::default(), pool, tx, Box::new(|| {}));

        let ack = stream.shared().ack_sender();
        std::thread::spawn(move || {
            let _chunk = rx.recv().unwrap();
            ack.send(Err("disk on fire".into())).unwrap();
        });

        let err = stream.write(b"abcd").unwrap_err();
        match err {
            RequestError::ShortWrite(ShortWrite { written, .. }) => assert_eq!(written, 0),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unacknowledged_policy_does_not_block_on_intermediate_chunks() {
        let pool = ChunkPool::new(4);
        let (tx, rx) = sink();
        let mut policy = Policy::default();
        policy.acknowledged = false;
        let mut stream = Stream::new("a", policy, pool, tx, Box::new(|| {}));

        // no reader on `rx` at all -- write must not block.
        stream.write(b"abcd").unwrap();
        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.bytes(), b"abcd");
    }
}
