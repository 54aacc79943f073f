//! Persistent inventory: a single relational table tracking every known
//! cartridge, keyed by serial. All access funnels through one worker thread
//! owning the `rusqlite` connection, so policy decisions (such as
//! get-scratch's compare-and-set) never race against a concurrent writer on
//! the same row from a different request.

use std::path::Path;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use rusqlite::{params, Connection, OptionalExtension};

use crate::changer::MtxStatus;
use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStatus {
    Scratch,
    Allocated,
    Suspect,
}

impl VolumeStatus {
    fn as_str(self) -> &'static str {
        match self {
            VolumeStatus::Scratch => "scratch",
            VolumeStatus::Allocated => "allocated",
            VolumeStatus::Suspect => "suspect",
        }
    }

    fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "scratch" => Ok(VolumeStatus::Scratch),
            "allocated" => Ok(VolumeStatus::Allocated),
            "suspect" => Ok(VolumeStatus::Suspect),
            other => Err(StorageError::Inventory(format!(
                "corrupt inventory row: unknown status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub serial: String,
    pub slot: Option<u64>,
    pub status: VolumeStatus,
    pub library: String,
}

enum Request {
    Audit {
        status: MtxStatus,
        library: String,
        reply: Sender<Result<(), StorageError>>,
    },
    Volumes {
        library: String,
        reply: Sender<Result<Vec<Volume>, StorageError>>,
    },
    Locate {
        serial: String,
        reply: Sender<Result<Option<String>, StorageError>>,
    },
    GetScratch {
        library: String,
        reply: Sender<Result<Volume, StorageError>>,
    },
    MarkSuspect {
        serial: String,
        reply: Sender<Result<(), StorageError>>,
    },
    Shutdown,
}

/// Handle to the inventory worker. Cloning shares the same underlying
/// worker thread and connection.
#[derive(Clone)]
pub struct Inventory {
    tx: Sender<Request>,
}

pub struct InventoryWorker {
    handle: JoinHandle<()>,
}

impl Inventory {
    /// Open (creating if necessary) the inventory database at `path` and
    /// spawn its worker thread.
    pub fn open(path: &Path) -> Result<(Inventory, InventoryWorker), StorageError> {
        let conn = Connection::open(path)
            .map_err(|err| StorageError::Inventory(format!("opening {path:?}: {err}")))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS volume (
                serial  TEXT PRIMARY KEY,
                slot    INTEGER,
                status  TEXT NOT NULL,
                library TEXT NOT NULL
            )",
            [],
        )
        .map_err(|err| StorageError::Inventory(err.to_string()))?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("inventory".to_string())
            .spawn(move || worker_loop(conn, rx))
            .expect("failed to spawn inventory worker thread");

        Ok((Inventory { tx }, InventoryWorker { handle }))
    }

    pub fn audit(&self, status: MtxStatus, library: impl Into<String>) -> Result<(), StorageError> {
        self.call(|reply| Request::Audit {
            status,
            library: library.into(),
            reply,
        })
    }

    pub fn volumes(&self, library: impl Into<String>) -> Result<Vec<Volume>, StorageError> {
        self.call(|reply| Request::Volumes {
            library: library.into(),
            reply,
        })
    }

    pub fn locate(&self, serial: impl Into<String>) -> Result<Option<String>, StorageError> {
        self.call(|reply| Request::Locate {
            serial: serial.into(),
            reply,
        })
    }

    pub fn get_scratch(&self, library: impl Into<String>) -> Result<Volume, StorageError> {
        self.call(|reply| Request::GetScratch {
            library: library.into(),
            reply,
        })
    }

    /// Quarantine a cartridge after a non-space media error: it is never
    /// handed out by `get_scratch` again for the lifetime of this run.
    pub fn mark_suspect(&self, serial: impl Into<String>) -> Result<(), StorageError> {
        self.call(|reply| Request::MarkSuspect {
            serial: serial.into(),
            reply,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown);
    }

    fn call<T>(&self, build: impl FnOnce(Sender<Result<T, StorageError>>) -> Request) -> Result<T, StorageError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(build(reply_tx))
            .map_err(|_| StorageError::Inventory("inventory worker has shut down".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| StorageError::Inventory("inventory worker dropped the reply channel".to_string()))?
    }
}

impl InventoryWorker {
    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn worker_loop(conn: Connection, rx: Receiver<Request>) {
    while let Ok(request) = rx.recv() {
        match request {
            Request::Audit { status, library, reply } => {
                let _ = reply.send(do_audit(&conn, &status, &library));
            }
            Request::Volumes { library, reply } => {
                let _ = reply.send(do_volumes(&conn, &library));
            }
            Request::Locate { serial, reply } => {
                let _ = reply.send(do_locate(&conn, &serial));
            }
            Request::GetScratch { library, reply } => {
                let _ = reply.send(do_get_scratch(&conn, &library));
            }
            Request::MarkSuspect { serial, reply } => {
                let _ = reply.send(do_mark_suspect(&conn, &serial));
            }
            Request::Shutdown => break,
        }
    }
}

fn do_audit(conn: &Connection, status: &MtxStatus, library: &str) -> Result<(), StorageError> {
    use crate::changer::ElementStatus;

    for (i, (_mail, element)) in status.slots.iter().enumerate() {
        let slot = (i + 1) as u64;
        let serial = match element {
            ElementStatus::VolumeTag(serial) => serial,
            _ => continue,
        };

        conn.execute(
            "INSERT OR IGNORE INTO volume (serial, slot, status, library) VALUES (?1, ?2, 'scratch', ?3)",
            params![serial, slot, library],
        )
        .map_err(|err| StorageError::Inventory(err.to_string()))?;

        // Never touches `status`: a cartridge already allocated stays
        // allocated even though it is re-seen sitting in its home slot.
        conn.execute(
            "UPDATE volume SET slot = ?2, library = ?3 WHERE serial = ?1",
            params![serial, slot, library],
        )
        .map_err(|err| StorageError::Inventory(err.to_string()))?;
    }

    Ok(())
}

fn row_to_volume(row: &rusqlite::Row) -> rusqlite::Result<(String, Option<u64>, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn do_volumes(conn: &Connection, library: &str) -> Result<Vec<Volume>, StorageError> {
    let mut stmt = conn
        .prepare("SELECT serial, slot, status, library FROM volume WHERE library = ?1 ORDER BY serial")
        .map_err(|err| StorageError::Inventory(err.to_string()))?;

    let rows = stmt
        .query_map(params![library], row_to_volume)
        .map_err(|err| StorageError::Inventory(err.to_string()))?;

    let mut volumes = Vec::new();
    for row in rows {
        let (serial, slot, status, library) =
            row.map_err(|err| StorageError::Inventory(err.to_string()))?;
        volumes.push(Volume {
            serial,
            slot,
            status: VolumeStatus::parse(&status)?,
            library,
        });
    }
    Ok(volumes)
}

fn do_locate(conn: &Connection, serial: &str) -> Result<Option<String>, StorageError> {
    conn.query_row(
        "SELECT library FROM volume WHERE serial = ?1",
        params![serial],
        |row| row.get(0),
    )
    .optional()
    .map_err(|err| StorageError::Inventory(err.to_string()))
}

fn do_get_scratch(conn: &Connection, library: &str) -> Result<Volume, StorageError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|err| StorageError::Inventory(err.to_string()))?;

    let found = tx
        .query_row(
            "SELECT serial, slot, status, library FROM volume
             WHERE status = 'scratch' AND library = ?1 AND slot IS NOT NULL
             LIMIT 1",
            params![library],
            row_to_volume,
        )
        .optional()
        .map_err(|err| StorageError::Inventory(err.to_string()))?;

    let (serial, slot, status, library) = found.ok_or_else(|| {
        StorageError::Inventory(format!("no scratch volume available in library '{library}'"))
    })?;

    tx.execute(
        "UPDATE volume SET status = 'allocated' WHERE serial = ?1",
        params![serial],
    )
    .map_err(|err| StorageError::Inventory(err.to_string()))?;

    tx.commit().map_err(|err| StorageError::Inventory(err.to_string()))?;

    Ok(Volume {
        serial,
        slot,
        status: VolumeStatus::parse(&status)?,
        library,
    })
}

fn do_mark_suspect(conn: &Connection, serial: &str) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE volume SET status = 'suspect' WHERE serial = ?1",
        params![serial],
    )
    .map_err(|err| StorageError::Inventory(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changer::ElementStatus;

    fn status_with(serials: &[&str]) -> MtxStatus {
        MtxStatus {
            drives: Vec::new(),
            slots: serials
                .iter()
                .map(|s| (false, ElementStatus::VolumeTag(s.to_string())))
                .collect(),
        }
    }

    #[test]
    fn audit_then_get_scratch_round_trip() {
        let (inv, worker) = Inventory::open(Path::new(":memory:")).unwrap();
        inv.audit(status_with(&["V001", "V002"]), "lib0").unwrap();

        let volumes = inv.volumes("lib0").unwrap();
        assert_eq!(volumes.len(), 2);

        let scratch = inv.get_scratch("lib0").unwrap();
        assert_eq!(scratch.status, VolumeStatus::Allocated);

        inv.shutdown();
        worker.join();
    }

    #[test]
    fn get_scratch_fails_when_none_available() {
        let (inv, worker) = Inventory::open(Path::new(":memory:")).unwrap();
        let err = inv.get_scratch("lib0").unwrap_err();
        assert!(matches!(err, StorageError::Inventory(_)));
        inv.shutdown();
        worker.join();
    }

    #[test]
    fn reaudit_does_not_demote_allocated_volume() {
        let (inv, worker) = Inventory::open(Path::new(":memory:")).unwrap();
        inv.audit(status_with(&["V001"]), "lib0").unwrap();
        inv.get_scratch("lib0").unwrap();

        // re-auditing the same slot must not reset the volume back to scratch
        inv.audit(status_with(&["V001"]), "lib0").unwrap();
        let volumes = inv.volumes("lib0").unwrap();
        assert_eq!(volumes[0].status, VolumeStatus::Allocated);

        inv.shutdown();
        worker.join();
    }

    #[test]
    fn locate_reports_library_for_known_serial() {
        let (inv, worker) = Inventory::open(Path::new(":memory:")).unwrap();
        inv.audit(status_with(&["V001"]), "lib0").unwrap();
        assert_eq!(inv.locate("V001").unwrap(), Some("lib0".to_string()));
        assert_eq!(inv.locate("unknown").unwrap(), None);
        inv.shutdown();
        worker.join();
    }

    #[test]
    fn suspect_volume_is_excluded_from_scratch() {
        let (inv, worker) = Inventory::open(Path::new(":memory:")).unwrap();
        inv.audit(status_with(&["V001"]), "lib0").unwrap();
        inv.mark_suspect("V001").unwrap();
        assert!(inv.get_scratch("lib0").is_err());
        inv.shutdown();
        worker.join();
    }
}
