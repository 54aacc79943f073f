//! Per-drive writer: turns chunks into files under the drive's current
//! mount point.
//!
//! A writer has exactly two terminal states: a clean stop request, or
//! reporting an `IoError` to the drive control loop. Either way the loop
//! stops -- the drive control loop is what decides whether and how to
//! build a replacement.

use std::io::Write as _;
use std::path::PathBuf;

use crossbeam_channel::{Receiver, Select, Sender};

use crate::catalog::SharedCatalog;
use crate::chunk::Chunk;
use crate::ltfs;

/// A chunk that failed to write, paired with the error that caused it.
pub struct IoError {
    pub chunk: Chunk,
    pub message: String,
    pub out_of_space: bool,
}

pub enum WriterEvent {
    Error(IoError),
    Stopped,
}

/// Runs until told to stop or until a chunk write fails. Call from a
/// dedicated OS thread; the drive control loop owns the handle.
pub struct Writer {
    mount_point: PathBuf,
    serial: String,
    catalog: SharedCatalog,
    /// Simulated cartridge capacity under `--mock`; `None` means rely on the
    /// real filesystem's own ENOSPC. Tracks bytes written since this writer
    /// (i.e. this cartridge) was built so end-of-media can be exercised
    /// deterministically in tests without filling a real disk.
    mock_capacity: Option<u64>,
    mock_written: u64,
    sequence: u64,
    direct: Receiver<Chunk>,
    aggregate: Option<Receiver<Chunk>>,
    stop: Receiver<()>,
    events: Sender<WriterEvent>,
}

impl Writer {
    pub fn new(
        mount_point: PathBuf,
        serial: String,
        catalog: SharedCatalog,
        mock_capacity: Option<u64>,
        direct: Receiver<Chunk>,
        aggregate: Option<Receiver<Chunk>>,
        stop: Receiver<()>,
        events: Sender<WriterEvent>,
    ) -> Self {
        Writer {
            mount_point,
            serial,
            catalog,
            mock_capacity,
            mock_written: 0,
            sequence: 0,
            direct,
            aggregate,
            stop,
            events,
        }
    }

    /// Drive the writer to completion. Blocks the calling thread.
    pub fn run(mut self) {
        loop {
            let chunk = match self.next_chunk() {
                Next::Chunk(chunk) => chunk,
                Next::Stop => {
                    let _ = self.events.send(WriterEvent::Stopped);
                    return;
                }
            };

            match self.write_chunk(&chunk) {
                Ok(()) => {
                    if let Err(err) = self.catalog.append(&chunk_archive(&chunk), chunk.id, &self.serial) {
                        let _ = self.events.send(WriterEvent::Error(IoError {
                            chunk,
                            message: err.to_string(),
                            out_of_space: false,
                        }));
                        return;
                    }

                    if chunk.want_ack {
                        if let Some(upstream) = chunk.upstream.as_ref() {
                            let _ = upstream.ack_sender().send(Ok(()));
                        }
                    }
                    chunk.reset();
                }
                Err((message, out_of_space)) => {
                    let _ = self.events.send(WriterEvent::Error(IoError {
                        chunk,
                        message,
                        out_of_space,
                    }));
                    return;
                }
            }
        }
    }

    fn next_chunk(&self) -> Next {
        let mut select = Select::new();
        let stop_idx = select.recv(&self.stop);
        let direct_idx = select.recv(&self.direct);
        let aggregate_idx = self.aggregate.as_ref().map(|rx| select.recv(rx));

        let op = select.select();
        match op.index() {
            i if i == stop_idx => {
                let _ = op.recv(&self.stop);
                Next::Stop
            }
            i if i == direct_idx => match op.recv(&self.direct) {
                Ok(chunk) => Next::Chunk(chunk),
                Err(_) => Next::Stop,
            },
            i if Some(i) == aggregate_idx => {
                let aggregate = self.aggregate.as_ref().unwrap();
                match op.recv(aggregate) {
                    Ok(chunk) => Next::Chunk(chunk),
                    Err(_) => Next::Stop,
                }
            }
            _ => unreachable!("select returned an unregistered index"),
        }
    }

    fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), (String, bool)> {
        if let Some(capacity) = self.mock_capacity {
            if self.mock_written + chunk.len() as u64 > capacity {
                return Err((format!("mock cartridge {} full", self.serial), true));
            }
        }

        self.sequence += 1;
        let path = ltfs::chunk_path(&self.mount_point, self.sequence, &chunk_archive(chunk), chunk.id);

        let result = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .and_then(|mut file| file.write_all(chunk.bytes()));

        match result {
            Ok(()) => {
                self.mock_written += chunk.len() as u64;
                Ok(())
            }
            Err(err) => {
                let out_of_space = err.raw_os_error() == Some(libc::ENOSPC);
                Err((format!("writing {path:?}: {err}"), out_of_space))
            }
        }
    }
}

fn chunk_archive(chunk: &Chunk) -> String {
    chunk
        .upstream
        .as_ref()
        .map(|shared| shared.archive.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

enum Next {
    Chunk(Chunk),
    Stop,
}
