//! End-of-media recovery, exercised through the real `Drive`/`Stream`
//! machinery with a mock changer and mock LTFS mount so no tape hardware
//! (or even real disk space pressure) is required -- the cartridge-boundary
//! and mid-stream peer hand-off scenarios from the write path's design.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tape_ingestd::catalog::Catalog;
use tape_ingestd::changer::mock::MockChanger;
use tape_ingestd::changer::{Changer, ElementStatus, MtxStatus};
use tape_ingestd::chunk::ChunkPool;
use tape_ingestd::drive::{self, DriveEnvironment, DriveHandle, UseReply};
use tape_ingestd::inventory::Inventory;
use tape_ingestd::ltfs::{MockLtfs, MockLtfsTimings};
use tape_ingestd::policy::Policy;
use tape_ingestd::stream::Stream;

fn scratch_inventory(serials: &[&str], library: &str) -> Inventory {
    let (inventory, worker) = Inventory::open(Path::new(":memory:")).unwrap();
    let status = MtxStatus {
        drives: Vec::new(),
        slots: serials
            .iter()
            .map(|s| (false, ElementStatus::VolumeTag(s.to_string())))
            .collect(),
    };
    inventory.audit(status, library).unwrap();
    // Leave the worker thread running detached for the test's lifetime;
    // dropping the handle doesn't stop it, only losing the ability to join.
    std::mem::forget(worker);
    inventory
}

fn spawn_drive(
    name: &str,
    changer: Arc<Changer>,
    inventory: Inventory,
    catalog: Arc<Catalog>,
    library: &str,
    drive_slot: u64,
    peers: Arc<OnceLock<Vec<DriveHandle>>>,
    mock_capacity: Option<u64>,
    mount_timings: MockLtfsTimings,
) -> DriveHandle {
    let ltfs_dir = tempfile::tempdir().unwrap();
    let env = DriveEnvironment {
        changer,
        inventory,
        catalog,
        library: library.to_string(),
        drive_slot,
        peers,
        mock_capacity,
    };
    let ltfs = Box::new(MockLtfs::with_timings(ltfs_dir.into_path(), mount_timings));
    let (handle, _join) = drive::spawn(name, env, ltfs, drive::DEFAULT_MAX_ATTACHED, None);
    handle
}

fn admit(handle: &DriveHandle) -> Stream {
    let catalog_archive = "archive";
    match handle.use_drive(Policy::default(), None).unwrap() {
        UseReply::Admitted { ingress, release } => {
            Stream::new(catalog_archive, Policy::default(), ChunkPool::new(1), ingress, release)
        }
        UseReply::Failed(err) => panic!("admission failed: {err}"),
    }
}

/// Scenario 2: a write that outlives one cartridge's capacity, with no peer
/// drive available, must fall back to local cartridge replacement and keep
/// going without the client ever seeing a failure.
#[test]
fn cartridge_boundary_crossing_uses_local_replacement() {
    let catalog_dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(Catalog::open(catalog_dir.path()).unwrap());
    catalog.create("archive").unwrap();

    let inventory = scratch_inventory(&["V001", "V002"], "lib0");
    let changer = Arc::new(Changer::new(Box::new(MockChanger::new("MOCK", 1, 4))));
    let peers: Arc<OnceLock<Vec<DriveHandle>>> = Arc::new(OnceLock::new());
    peers.set(Vec::new()).unwrap();

    let handle = spawn_drive(
        "d0",
        changer,
        inventory,
        catalog.clone(),
        "lib0",
        0,
        peers,
        Some(4),
        MockLtfsTimings::default(),
    );

    let mut stream = admit(&handle);
    stream.write(&[1, 2, 3, 4, 5, 6]).unwrap();
    stream.close().unwrap();

    let entries = catalog.iterate("archive").unwrap();
    // Six 1-byte chunks dispatched while writing, plus one empty final
    // chunk `close` always flushes regardless of how evenly the data
    // divided into chunks.
    assert_eq!(entries.len(), 7, "unexpected chunk count: {entries:?}");

    let first_serial = &entries[0].1;
    let fourth_serial = &entries[3].1;
    assert_eq!(first_serial, fourth_serial, "first four chunks share one cartridge");

    let fifth_serial = &entries[4].1;
    assert_ne!(
        first_serial, fifth_serial,
        "end-of-media must have rolled onto a second cartridge"
    );

    // Every chunk landed exactly once: ids are dense, 1..=len.
    let ids: Vec<u64> = entries.iter().map(|(id, _)| *id).collect();
    let expected: Vec<u64> = (1..=ids.len() as u64).collect();
    assert_eq!(ids, expected);
}

/// Scenario 3: with a second drive available and this drive's own local
/// replacement made artificially slow, the failed chunk (and everything
/// after it) should land on the peer instead of waiting for local recovery.
#[test]
fn mid_stream_handoff_prefers_a_ready_peer() {
    let catalog_dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(Catalog::open(catalog_dir.path()).unwrap());
    catalog.create("archive").unwrap();

    let inventory = scratch_inventory(&["V001", "V002"], "lib0");
    let changer = Arc::new(Changer::new(Box::new(MockChanger::new("MOCK", 2, 4))));
    let peers: Arc<OnceLock<Vec<DriveHandle>>> = Arc::new(OnceLock::new());

    let slow_mount = MockLtfsTimings {
        mount: Duration::from_millis(300),
        ..Default::default()
    };

    let d0 = spawn_drive(
        "d0",
        changer.clone(),
        inventory.clone(),
        catalog.clone(),
        "lib0",
        0,
        peers.clone(),
        Some(2),
        slow_mount,
    );
    let d1 = spawn_drive(
        "d1",
        changer,
        inventory,
        catalog.clone(),
        "lib0",
        1,
        peers.clone(),
        None,
        MockLtfsTimings::default(),
    );
    peers.set(vec![d0.clone(), d1]).unwrap();

    let mut stream = admit(&d0);
    stream.write(&[1, 2, 3, 4]).unwrap();
    stream.close().unwrap();

    let entries = catalog.iterate("archive").unwrap();
    // Four 1-byte chunks plus the empty final chunk from `close`.
    assert_eq!(entries.len(), 5, "unexpected chunk count: {entries:?}");

    let first_serial = &entries[0].1;
    let second_serial = &entries[1].1;
    assert_eq!(first_serial, second_serial, "first two chunks fit on drive 0's cartridge");

    let third_serial = &entries[2].1;
    assert_ne!(first_serial, third_serial, "the rest handed off to the peer's cartridge");
}
