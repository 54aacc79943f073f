//! Drive admission state machine, exercised directly against `Drive`'s
//! request/reply channels and through `acquire`'s fair-race pool -- no
//! hardware, no chunk writes, just the exclusive/shared bookkeeping.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tape_ingestd::acquire;
use tape_ingestd::catalog::Catalog;
use tape_ingestd::changer::mock::MockChanger;
use tape_ingestd::changer::{Changer, ElementStatus, MtxStatus};
use tape_ingestd::drive::{self, DriveEnvironment, DriveHandle, UseReply};
use tape_ingestd::inventory::Inventory;
use tape_ingestd::ltfs::MockLtfs;
use tape_ingestd::policy::Policy;

fn scratch_inventory(library: &str) -> Inventory {
    let (inventory, worker) = Inventory::open(Path::new(":memory:")).unwrap();
    let status = MtxStatus {
        drives: Vec::new(),
        slots: vec![
            (false, ElementStatus::VolumeTag("V001".to_string())),
            (false, ElementStatus::VolumeTag("V002".to_string())),
        ],
    };
    inventory.audit(status, library).unwrap();
    std::mem::forget(worker);
    inventory
}

fn spawn_drive(name: &str, max_attached: u32) -> DriveHandle {
    let catalog_dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(Catalog::open(catalog_dir.path()).unwrap());
    let inventory = scratch_inventory("lib0");
    let changer = Arc::new(Changer::new(Box::new(MockChanger::new("MOCK", 1, 4))));
    let ltfs_dir = tempfile::tempdir().unwrap();

    let env = DriveEnvironment {
        changer,
        inventory,
        catalog,
        library: "lib0".to_string(),
        drive_slot: 0,
        peers: Arc::new(OnceLock::new()),
        mock_capacity: None,
    };
    let ltfs = Box::new(MockLtfs::new(ltfs_dir.into_path()));
    let (handle, _join) = drive::spawn(name, env, ltfs, max_attached, None);
    handle
}

fn exclusive_policy() -> Policy {
    Policy {
        exclusive: true,
        ..Policy::default()
    }
}

/// A second exclusive request must block (and ultimately time out) while the
/// first holder is still attached, then succeed once it releases.
#[test]
fn exclusive_use_blocks_until_release() {
    let drive = spawn_drive("d0", drive::DEFAULT_MAX_ATTACHED);

    let first = match drive.use_drive(exclusive_policy(), None).unwrap() {
        UseReply::Admitted { release, .. } => release,
        UseReply::Failed(err) => panic!("first exclusive admission failed: {err}"),
    };

    let short_deadline = Some(Instant::now() + Duration::from_millis(50));
    let blocked = drive.use_drive(exclusive_policy(), short_deadline);
    assert!(blocked.is_err(), "second exclusive request must not be admitted while the first is attached");

    let mut release = first;
    release();

    match drive.use_drive(exclusive_policy(), Some(Instant::now() + Duration::from_secs(1))).unwrap() {
        UseReply::Admitted { .. } => {}
        UseReply::Failed(err) => panic!("exclusive admission after release failed: {err}"),
    }
}

/// Shared fan-in is bounded by `max_attached`: once the bound is reached
/// further shared requests queue, and a release promotes exactly one queued
/// waiter.
#[test]
fn shared_fan_in_is_bounded_and_promotes_waiters() {
    let drive = spawn_drive("d0", 2);

    let admit = |deadline| match drive.use_drive(Policy::default(), deadline) {
        Ok(UseReply::Admitted { release, .. }) => Ok(release),
        Ok(UseReply::Failed(err)) => Err(err.to_string()),
        Err(err) => Err(err.to_string()),
    };

    let first = admit(None).expect("first shared admission");
    let _second = admit(None).expect("second shared admission");

    let short_deadline = Some(Instant::now() + Duration::from_millis(50));
    assert!(
        admit(short_deadline).is_err(),
        "a third shared request must queue behind the max_attached bound, not admit immediately"
    );

    // A blocking waiter, queued behind the bound, should be promoted as soon
    // as a slot frees up.
    let waiter_handle = drive.clone();
    let promoted = std::thread::spawn(move || {
        waiter_handle.use_drive(Policy::default(), Some(Instant::now() + Duration::from_secs(2)))
    });
    std::thread::sleep(Duration::from_millis(50));

    let mut release_first = first;
    release_first();

    match promoted.join().unwrap().unwrap() {
        UseReply::Admitted { .. } => {}
        UseReply::Failed(err) => panic!("queued waiter was not promoted: {err}"),
    }
}

/// A request that times out before the drive gets around to admitting it
/// must not leave the drive thinking a stream is still attached.
#[test]
fn cancelled_request_does_not_leak_attachment() {
    let drive = spawn_drive("d0", 1);

    let first = match drive.use_drive(Policy::default(), None).unwrap() {
        UseReply::Admitted { release, .. } => release,
        UseReply::Failed(err) => panic!("first admission failed: {err}"),
    };

    // This request queues behind the max_attached(1) bound; give it a
    // deadline that has already elapsed by the time the drive reads the
    // reply channel's remaining budget, so it gives up before ever being
    // admitted.
    let already_elapsed = Some(Instant::now());
    let cancelled = drive.use_drive(Policy::default(), already_elapsed);
    assert!(cancelled.is_err(), "expected the immediately-expired request to time out");

    // Give the drive's control loop a moment to actually enqueue the
    // now-abandoned waiter before releasing the first holder.
    std::thread::sleep(Duration::from_millis(50));

    let mut release_first = first;
    release_first();

    // If the abandoned waiter had leaked an attachment, max_attached(1)
    // would now be exhausted and this would time out instead of admitting.
    match drive.use_drive(Policy::default(), Some(Instant::now() + Duration::from_millis(500))) {
        Ok(UseReply::Admitted { .. }) => {}
        Ok(UseReply::Failed(err)) => panic!("fresh request failed: {err}"),
        Err(err) => panic!("fresh request after release leaked an attachment: {err}"),
    }
}

/// Racing a `Use` request against a pool of idle drives admits onto exactly
/// one of them; the drive that loses the race must not be left attached.
#[test]
fn acquire_picks_one_drive_and_releases_the_other() {
    let d0 = spawn_drive("d0", drive::DEFAULT_MAX_ATTACHED);
    let d1 = spawn_drive("d1", drive::DEFAULT_MAX_ATTACHED);
    let pool = vec![d0.clone(), d1.clone()];

    let admission = acquire::acquire(&pool, Policy::default(), None).unwrap();
    let winner_name = admission.drive.name.clone();
    admission.release();

    let loser = if winner_name == d0.name { &d1 } else { &d0 };

    // The losing drive's spurious admission is released by a background
    // drain thread in `acquire`; allow it a generous window before
    // concluding it leaked.
    let deadline = Some(Instant::now() + Duration::from_millis(500));
    match loser.use_drive(exclusive_policy(), deadline) {
        Ok(UseReply::Admitted { .. }) => {}
        Ok(UseReply::Failed(err)) => panic!("losing drive reports attached: {err}"),
        Err(err) => panic!("losing drive never released its spurious admission: {err}"),
    }
}

/// A shared request that queues while the drive is held *exclusively* must
/// be promoted once the exclusive holder releases, not left starving behind
/// a drive that (wrongly) still thinks it's unshareable.
#[test]
fn shared_waiter_is_promoted_after_exclusive_release() {
    let drive = spawn_drive("d0", drive::DEFAULT_MAX_ATTACHED);

    let first = match drive.use_drive(exclusive_policy(), None).unwrap() {
        UseReply::Admitted { release, .. } => release,
        UseReply::Failed(err) => panic!("exclusive admission failed: {err}"),
    };

    let waiter_handle = drive.clone();
    let queued = std::thread::spawn(move || {
        waiter_handle.use_drive(Policy::default(), Some(Instant::now() + Duration::from_secs(2)))
    });
    std::thread::sleep(Duration::from_millis(50));

    let mut release_first = first;
    release_first();

    match queued.join().unwrap().unwrap() {
        UseReply::Admitted { .. } => {}
        UseReply::Failed(err) => panic!("shared waiter queued during exclusive hold was not promoted: {err}"),
    }
}

/// A drive spawned before its library has any scratch volumes (e.g. a fresh
/// deployment, before the first `--audit` runs) must not stay writer-less
/// forever: once a scratch volume exists, admission should mount lazily
/// instead of leaving every `Use` to hang waiting on a writer that never
/// started.
#[test]
fn drive_mounts_lazily_once_scratch_becomes_available() {
    let catalog_dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(Catalog::open(catalog_dir.path()).unwrap());
    let (inventory, _worker) = Inventory::open(Path::new(":memory:")).unwrap();
    let changer = Arc::new(Changer::new(Box::new(MockChanger::new("MOCK", 1, 4))));
    let ltfs_dir = tempfile::tempdir().unwrap();

    let env = DriveEnvironment {
        changer,
        inventory: inventory.clone(),
        catalog,
        library: "lib0".to_string(),
        drive_slot: 0,
        peers: Arc::new(OnceLock::new()),
        mock_capacity: None,
    };
    let ltfs = Box::new(MockLtfs::new(ltfs_dir.into_path()));
    let (drive, _join) = drive::spawn("d0", env, ltfs, drive::DEFAULT_MAX_ATTACHED, None);

    // Nothing to mount yet: the drive's own startup attempt fails silently
    // and it comes up writer-less.
    match drive.use_drive(Policy::default(), Some(Instant::now() + Duration::from_millis(50))) {
        Ok(UseReply::Failed(_)) => {}
        Ok(UseReply::Admitted { .. }) => panic!("admission succeeded with no scratch volume ever audited in"),
        Err(err) => panic!("admission before any scratch volume exists should fail fast, not hang: {err}"),
    }

    let status = MtxStatus {
        drives: Vec::new(),
        slots: vec![(false, ElementStatus::VolumeTag("V001".to_string()))],
    };
    inventory.audit(status, "lib0").unwrap();

    match drive.use_drive(Policy::default(), Some(Instant::now() + Duration::from_secs(2))) {
        Ok(UseReply::Admitted { .. }) => {}
        Ok(UseReply::Failed(err)) => panic!("drive never mounted after scratch became available: {err}"),
        Err(err) => panic!("admission timed out after scratch became available: {err}"),
    }
}

/// An empty pool can never admit anything.
#[test]
fn acquire_rejects_empty_pool() {
    let pool: Vec<DriveHandle> = Vec::new();
    let result = acquire::acquire(&pool, Policy::default(), None);
    assert!(result.is_err());
}
