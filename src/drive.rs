//! The drive control loop: the central state machine of the write path.
//!
//! Everything that mutates a drive's `attached`/`shared`/`writer`/`cartridge`
//! state runs on one OS thread that owns that state outright and
//! communicates with the rest of the system only through typed request and
//! reply channels -- the actor-per-resource model described for this crate.
//!
//! End-of-media hand-off (`begin_handoff`) races two concurrent attempts:
//! offering the failed chunk to a peer drive from the same pool, and
//! replacing this drive's own cartridge locally. Both run on detached
//! threads and report back to the control loop over a reply channel;
//! whichever claims the shared `AtomicBool` first gets the chunk, the other
//! backs off. Local replacement always runs to completion regardless of who
//! wins, since this drive needs a working cartridge again for whatever else
//! is attached to it -- only the disposition of the one failed chunk is
//! actually raced.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Select, Sender};

use crate::acquire;
use crate::catalog::SharedCatalog;
use crate::changer::Changer;
use crate::chunk::Chunk;
use crate::error::{AdmissionError, MediaError};
use crate::inventory::Inventory;
use crate::ltfs::LtfsDriver;
use crate::policy::Policy;
use crate::writer::{IoError, Writer, WriterEvent};

pub const DEFAULT_MAX_ATTACHED: u32 = 4;

/// Reply to a `Use` request: either admission (with the channel the stream
/// should send chunks to and a release callback) or a failure.
pub enum UseReply {
    Admitted {
        ingress: Sender<Chunk>,
        release: Box<dyn FnMut() + Send>,
    },
    Failed(AdmissionError),
}

pub struct UseRequest {
    pub policy: Policy,
    pub deadline: Option<Instant>,
    pub reply: Sender<UseReply>,
}

pub enum DriveRequest {
    Use(UseRequest),
    Release,
    Takeover { chunk: Chunk },
    Shutdown,
}

#[derive(Clone)]
pub struct DriveHandle {
    tx: Sender<DriveRequest>,
    pub name: String,
}

impl DriveHandle {
    pub fn use_drive(&self, policy: Policy, deadline: Option<Instant>) -> Result<UseReply, AdmissionError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self
            .tx
            .send(DriveRequest::Use(UseRequest {
                policy,
                deadline,
                reply: reply_tx,
            }))
            .is_err()
        {
            return Err(AdmissionError::AcquireTimeout(Duration::ZERO));
        }

        match deadline {
            None => reply_rx
                .recv()
                .map_err(|_| AdmissionError::AcquireTimeout(Duration::ZERO)),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                reply_rx
                    .recv_timeout(remaining)
                    .map_err(|_| AdmissionError::AcquireTimeout(remaining))
            }
        }
    }

    pub fn release(&self) {
        let _ = self.tx.send(DriveRequest::Release);
    }

    pub fn takeover(&self, chunk: Chunk) {
        let _ = self.tx.send(DriveRequest::Takeover { chunk });
    }

    pub fn request_sender(&self) -> Sender<DriveRequest> {
        self.tx.clone()
    }
}

/// Shared context every drive needs to recover from a failed cartridge: the
/// changer that loads/unloads it, the inventory that hands out scratch
/// volumes, the catalog the writer records placements in, and the pool of
/// sibling drives a failed stream can be offered to.
///
/// `peers` is filled in once, after every drive in the pool has been
/// spawned (see `server::Server::build`) -- a drive needs to know its
/// siblings' handles before it can race a hand-off against them, but those
/// handles don't exist until every drive including this one has started.
/// `OnceLock` lets each drive hold a reference to that eventual list without
/// the chicken-and-egg problem of needing it at construction time.
pub struct DriveEnvironment {
    pub changer: Arc<Changer>,
    pub inventory: Inventory,
    pub catalog: SharedCatalog,
    pub library: String,
    /// This drive's data-transfer-element number within its changer -- the
    /// `drive_slot` argument to every `load`/`unload` call. A cartridge's
    /// storage slot, by contrast, travels with the `Volume` inventory
    /// returns and is never fixed per drive.
    pub drive_slot: u64,
    pub peers: Arc<OnceLock<Vec<DriveHandle>>>,
    /// Simulated per-cartridge capacity under `--mock`; forwarded to every
    /// writer this drive builds.
    pub mock_capacity: Option<u64>,
}

struct Waiter {
    request: UseRequest,
}

/// What a hand-off's peer-acquisition or local-replacement task reports
/// back to the control loop.
enum RecoveryOutcome {
    /// A peer drive accepted the failed chunk; the chunk has already been
    /// enqueued there (or, if local had already claimed it, nothing was
    /// handed off and this is discarded by the control loop with nothing to
    /// do besides log).
    PeerTookOver,
    /// Local replacement finished mounting a fresh cartridge. `chunk` is
    /// `Some` iff local won the race for the failed chunk and it should be
    /// re-injected on this drive's own ingress.
    Local {
        mount_point: PathBuf,
        serial: String,
        home_slot: u64,
        chunk: Option<Chunk>,
    },
    LocalFailed(String),
}

/// Runs the drive control loop on the calling thread. Spawn this on a
/// dedicated OS thread; use the returned [`DriveHandle`] to talk to it.
pub struct Drive {
    name: String,
    env: DriveEnvironment,
    ltfs: Arc<Mutex<Box<dyn LtfsDriver>>>,
    max_attached: u32,

    attached: u32,
    shared: bool,
    exclusive_waiters: VecDeque<Waiter>,
    shared_waiters: VecDeque<Waiter>,

    /// The mounted cartridge's serial and its home storage slot (needed to
    /// unload it back to the slot it actually lives in, not a fixed one).
    cartridge: Option<(String, u64)>,

    self_tx: Sender<DriveRequest>,
    ingress_tx: Sender<Chunk>,
    ingress_rx: Receiver<Chunk>,
    aggregate_rx: Option<Receiver<Chunk>>,

    writer_stop_tx: Option<Sender<()>>,
    writer_events_rx: Option<Receiver<WriterEvent>>,
    writer_handle: Option<std::thread::JoinHandle<()>>,

    recovery_rx: Option<Receiver<RecoveryOutcome>>,

    control_rx: Receiver<DriveRequest>,
}

pub fn spawn(
    name: impl Into<String>,
    env: DriveEnvironment,
    ltfs: Box<dyn LtfsDriver>,
    max_attached: u32,
    aggregate_rx: Option<Receiver<Chunk>>,
) -> (DriveHandle, std::thread::JoinHandle<()>) {
    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let (ingress_tx, ingress_rx) = crossbeam_channel::unbounded();
    let name = name.into();

    let drive = Drive {
        name: name.clone(),
        env,
        ltfs: Arc::new(Mutex::new(ltfs)),
        max_attached,
        attached: 0,
        shared: true,
        exclusive_waiters: VecDeque::new(),
        shared_waiters: VecDeque::new(),
        cartridge: None,
        self_tx: control_tx.clone(),
        ingress_tx,
        ingress_rx,
        aggregate_rx,
        writer_stop_tx: None,
        writer_events_rx: None,
        writer_handle: None,
        recovery_rx: None,
        control_rx,
    };

    let join = std::thread::Builder::new()
        .name(format!("drive-{name}"))
        .spawn(move || drive.run())
        .expect("failed to spawn drive control thread");

    (
        DriveHandle {
            tx: control_tx,
            name,
        },
        join,
    )
}

impl Drive {
    fn run(mut self) {
        // Best-effort only: on a freshly deployed inventory with no scratch
        // volumes yet, this fails and the drive starts writer-less. That's
        // fine -- `ensure_mounted` retries on the first `Use` admission, by
        // which point an operator has likely run `--audit` or `PATCH
        // /cmd/audit/{library}`. Don't log at `error` for a condition the
        // drive recovers from on its own.
        if let Err(err) = self.mount_fresh_cartridge() {
            log::info!(
                "drive {}: no cartridge mounted at startup ({err}); will mount on first use",
                self.name
            );
        }

        loop {
            let mut select = Select::new();
            let control_idx = select.recv(&self.control_rx);
            let writer_idx = self.writer_events_rx.as_ref().map(|rx| select.recv(rx));
            let recovery_idx = self.recovery_rx.as_ref().map(|rx| select.recv(rx));

            let op = select.select();
            if op.index() == control_idx {
                match op.recv(&self.control_rx) {
                    Ok(request) => {
                        if !self.handle_request(request) {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            } else if Some(op.index()) == writer_idx {
                let rx = self.writer_events_rx.clone().unwrap();
                let event = op.recv(&rx);
                self.writer_events_rx = None;
                if let Some(handle) = self.writer_handle.take() {
                    let _ = handle.join();
                }
                match event {
                    Ok(WriterEvent::Stopped) | Err(_) => {}
                    Ok(WriterEvent::Error(err)) => self.handle_writer_error(err),
                }
            } else if Some(op.index()) == recovery_idx {
                let rx = self.recovery_rx.clone().unwrap();
                let outcome = op.recv(&rx);
                self.handle_recovery_outcome(outcome);
            }
        }
    }

    fn handle_request(&mut self, request: DriveRequest) -> bool {
        match request {
            DriveRequest::Use(req) => {
                self.handle_use(req);
                true
            }
            DriveRequest::Release => {
                self.handle_release();
                true
            }
            DriveRequest::Takeover { chunk } => {
                self.handle_takeover(chunk);
                true
            }
            DriveRequest::Shutdown => {
                if let Some(stop) = &self.writer_stop_tx {
                    let _ = stop.send(());
                }
                false
            }
        }
    }

    fn handle_use(&mut self, req: UseRequest) {
        if req.policy.exclusive {
            if self.attached == 0 {
                self.admit_exclusive(req);
            } else {
                self.exclusive_waiters.push_back(Waiter { request: req });
            }
            return;
        }

        if self.shared && self.attached < self.max_attached {
            self.admit_shared(req);
        } else {
            self.shared_waiters.push_back(Waiter { request: req });
        }
    }

    fn admit_exclusive(&mut self, req: UseRequest) {
        if let Err(err) = self.ensure_mounted() {
            self.reply_failed(req, err);
            return;
        }
        self.attached = 1;
        self.shared = false;
        self.reply_admitted(req);
    }

    fn admit_shared(&mut self, req: UseRequest) {
        if let Err(err) = self.ensure_mounted() {
            self.reply_failed(req, err);
            return;
        }
        self.attached += 1;
        self.reply_admitted(req);
    }

    /// Mount a cartridge and spawn its writer if this drive doesn't already
    /// have one. Called right before the first admission actually hands the
    /// stream an ingress channel, so a drive that started up before its
    /// library's inventory was populated still becomes usable once scratch
    /// volumes exist, without anything else needing to poke it.
    fn ensure_mounted(&mut self) -> Result<(), MediaError> {
        if self.writer_handle.is_some() {
            return Ok(());
        }
        self.mount_fresh_cartridge()
    }

    fn reply_failed(&mut self, req: UseRequest, err: MediaError) {
        let _ = req
            .reply
            .send(UseReply::Failed(AdmissionError::DriveUnavailable(err.to_string())));
    }

    fn reply_admitted(&mut self, req: UseRequest) {
        let tx = self.self_tx.clone();
        let release = Box::new(move || {
            let _ = tx.send(DriveRequest::Release);
        });

        let admitted = UseReply::Admitted {
            ingress: self.ingress_tx.clone(),
            release,
        };

        if req.reply.send(admitted).is_err() {
            // The requester cancelled (timed out) between sending Use and us
            // admitting it. Don't leak the admission: release immediately.
            self.handle_release();
        }
    }

    fn handle_release(&mut self) {
        if self.attached > 0 {
            self.attached -= 1;
        }

        if self.attached == 0 {
            if let Some(waiter) = self.exclusive_waiters.pop_front() {
                self.admit_exclusive(waiter.request);
                return;
            }
            // Not promoted to a new exclusive holder: the drive is free to
            // serve shared streams again. Must happen before the
            // shared-waiter check below, or a waiter queued while this drive
            // was held exclusively never gets promoted (`self.shared` would
            // still read `false` from the exclusive admission that just
            // ended) and starves until its deadline.
            self.shared = true;
        }

        if self.shared && self.attached < self.max_attached {
            if let Some(waiter) = self.shared_waiters.pop_front() {
                self.admit_shared(waiter.request);
            }
        }
    }

    fn handle_takeover(&mut self, mut chunk: Chunk) {
        if let Some(upstream) = chunk.upstream.clone() {
            if !upstream.policy.parallel() {
                upstream.set_out(self.ingress_tx.clone());
                let tx = self.self_tx.clone();
                upstream.set_on_close(Box::new(move || {
                    let _ = tx.send(DriveRequest::Release);
                }));
            }
        }
        let _ = self.ingress_tx.send(chunk);
    }

    fn handle_writer_error(&mut self, err: IoError) {
        if err.out_of_space {
            log::info!("drive {}: end of media, starting hand-off", self.name);
            self.begin_handoff(err.chunk);
        } else {
            log::warn!("drive {}: media error: {}", self.name, err.message);
            if let Some((serial, _)) = self.cartridge.clone() {
                let _ = self.env.inventory.mark_suspect(&serial);
            }
            if let Some(upstream) = err.chunk.upstream.as_ref() {
                let _ = upstream.ack_sender().send(Err(err.message));
            }
            err.chunk.reset();
            self.replace_cartridge_sync();
        }
    }

    /// Races peer acquisition against local cartridge replacement for one
    /// failed chunk. See the module-level doc comment for the shape of the
    /// race; this just sets it in motion and returns -- the outcome arrives
    /// later on `recovery_rx` and is handled by `handle_recovery_outcome`.
    fn begin_handoff(&mut self, chunk: Chunk) {
        let policy = chunk.upstream.as_ref().map(|u| u.policy.clone());
        let parallel = policy.as_ref().map(Policy::parallel).unwrap_or(true);

        let peers: Vec<DriveHandle> = self
            .env
            .peers
            .get()
            .map(|all| {
                all.iter()
                    .filter(|d| d.name != self.name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let claimed = Arc::new(AtomicBool::new(false));
        let chunk_cell: Arc<Mutex<Option<Chunk>>> = Arc::new(Mutex::new(Some(chunk)));
        let (recovery_tx, recovery_rx) = crossbeam_channel::bounded(2);
        self.recovery_rx = Some(recovery_rx);

        if !parallel && !peers.is_empty() {
            if let Some(policy) = policy {
                let claimed = claimed.clone();
                let chunk_cell = chunk_cell.clone();
                let recovery_tx = recovery_tx.clone();
                let deadline = policy.exclusive_timeout.map(|d| Instant::now() + d);

                std::thread::spawn(move || {
                    if let Ok(admission) = acquire::acquire(&peers, policy, deadline) {
                        if claimed
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            if let Some(chunk) = chunk_cell.lock().unwrap().take() {
                                admission.drive.takeover(chunk);
                            }
                            let _ = recovery_tx.send(RecoveryOutcome::PeerTookOver);
                        } else {
                            admission.release();
                        }
                    }
                });
            }
        }

        let changer = self.env.changer.clone();
        let inventory = self.env.inventory.clone();
        let library = self.env.library.clone();
        let drive_slot = self.env.drive_slot;
        let ltfs = self.ltfs.clone();
        let old_cartridge = self.cartridge.take();

        std::thread::spawn(move || {
            if let Some((serial, home_slot)) = old_cartridge {
                let _ = changer.unload(home_slot, drive_slot);
                let _ = ltfs.lock().unwrap().unmount(&serial);
            }

            let mounted: Result<(PathBuf, String, u64), MediaError> = (|| {
                let volume = inventory
                    .get_scratch(library)
                    .map_err(|err| MediaError::MountFailed(err.to_string()))?;
                let home_slot = volume.slot.ok_or_else(|| {
                    MediaError::MountFailed(format!("scratch volume {} has no home slot", volume.serial))
                })?;
                changer.load(home_slot, drive_slot)?;
                ltfs.lock().unwrap().format(&volume.serial)?;
                let mount_point = ltfs.lock().unwrap().mount(&volume.serial)?;
                Ok((mount_point, volume.serial, home_slot))
            })();

            match mounted {
                Ok((mount_point, serial, home_slot)) => {
                    let took_chunk = if claimed
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        chunk_cell.lock().unwrap().take()
                    } else {
                        None
                    };
                    let _ = recovery_tx.send(RecoveryOutcome::Local {
                        mount_point,
                        serial,
                        home_slot,
                        chunk: took_chunk,
                    });
                }
                Err(err) => {
                    let _ = recovery_tx.send(RecoveryOutcome::LocalFailed(err.to_string()));
                }
            }
        });
    }

    fn handle_recovery_outcome(&mut self, outcome: Result<RecoveryOutcome, crossbeam_channel::RecvError>) {
        match outcome {
            Ok(RecoveryOutcome::PeerTookOver) => {
                log::info!("drive {}: peer drive took over the in-flight chunk", self.name);
                self.handle_release();
                // Local replacement is still in flight; keep recovery_rx
                // open so this drive ends up with a working cartridge too.
            }
            Ok(RecoveryOutcome::Local { mount_point, serial, home_slot, chunk }) => {
                self.cartridge = Some((serial.clone(), home_slot));
                self.spawn_writer(mount_point, serial);
                if let Some(chunk) = chunk {
                    let _ = self.ingress_tx.send(chunk);
                }
                self.recovery_rx = None;
            }
            Ok(RecoveryOutcome::LocalFailed(message)) => {
                log::error!("drive {}: unable to mount replacement cartridge: {message}", self.name);
                self.recovery_rx = None;
            }
            Err(_) => {
                self.recovery_rx = None;
            }
        }
    }

    fn replace_cartridge_sync(&mut self) {
        if let Some((serial, home_slot)) = self.cartridge.take() {
            let _ = self.env.changer.unload(home_slot, self.env.drive_slot);
            let _ = self.ltfs.lock().unwrap().unmount(&serial);
        }

        if let Err(err) = self.mount_fresh_cartridge() {
            log::error!("drive {}: unable to mount replacement cartridge: {err}", self.name);
        }
    }

    fn mount_fresh_cartridge(&mut self) -> Result<(), MediaError> {
        let volume = self
            .env
            .inventory
            .get_scratch(self.env.library.clone())
            .map_err(|err| MediaError::MountFailed(err.to_string()))?;
        let home_slot = volume.slot.ok_or_else(|| {
            MediaError::MountFailed(format!("scratch volume {} has no home slot", volume.serial))
        })?;

        self.env.changer.load(home_slot, self.env.drive_slot)?;
        self.ltfs.lock().unwrap().format(&volume.serial)?;
        let mount_point = self.ltfs.lock().unwrap().mount(&volume.serial)?;

        self.cartridge = Some((volume.serial.clone(), home_slot));
        self.spawn_writer(mount_point, volume.serial);

        Ok(())
    }

    fn spawn_writer(&mut self, mount_point: PathBuf, serial: String) {
        let (stop_tx, stop_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let writer = Writer::new(
            mount_point,
            serial,
            self.env.catalog.clone(),
            self.env.mock_capacity,
            self.ingress_rx.clone(),
            self.aggregate_rx.clone(),
            stop_rx,
            events_tx,
        );
        let handle = std::thread::Builder::new()
            .name(format!("writer-{}", self.name))
            .spawn(move || writer.run())
            .expect("failed to spawn writer thread");

        self.writer_stop_tx = Some(stop_tx);
        self.writer_events_rx = Some(events_rx);
        self.writer_handle = Some(handle);
    }
}
