//! Server: the process-wide owner of every library, drive, group, and the
//! inventory/catalog handles behind them. Built once from [`Config`] at
//! startup; the HTTP surface holds an `Arc<Server>` and calls into it from
//! blocking worker threads.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use crate::acquire;
use crate::catalog::{Catalog, SharedCatalog};
use crate::changer::mock::MockChanger;
use crate::changer::mtx::MtxChanger;
use crate::changer::{Changer, ChangerDriver, MtxStatus};
use crate::chunk::{Chunk, ChunkPool};
use crate::config::{ChangerKind, Config, DriveKind};
use crate::drive::{self, DriveEnvironment, DriveHandle};
use crate::error::{AdmissionError, RequestError};
use crate::group::DriveGroup;
use crate::inventory::{Inventory, InventoryWorker};
use crate::ltfs::{ExternalLtfs, LtfsDriver, MockLtfs};
use crate::policy::Policy;
use crate::stream::Stream;

/// Storage slots provisioned per mocked changer when none is configured
/// explicitly: generous enough that the small fleets exercised by `--mock`
/// runs and the test suite never run out of scratch cartridges by accident.
const MOCK_SLOTS_PER_DRIVE: u64 = 4;
const MIN_MOCK_SLOTS: u64 = 8;

pub struct Server {
    catalog: SharedCatalog,
    inventory: Inventory,
    _inventory_worker: InventoryWorker,
    pool: ChunkPool,
    changers: HashMap<String, Arc<Changer>>,
    write_pool: Vec<DriveHandle>,
    groups: HashMap<String, DriveGroup>,
    _drive_threads: Vec<std::thread::JoinHandle<()>>,
}

impl Server {
    /// Build every actor named in `config` and start its thread. `mock`
    /// forces every changer and LTFS mount in the topology to the in-memory
    /// implementations regardless of what the config's `changer` blocks say
    /// -- used by `--mock` server runs and the integration-style tests.
    pub fn build(config: &Config, mock: bool) -> Result<Server> {
        let catalog: SharedCatalog = Arc::new(
            Catalog::open(&config.chunkstore.path)
                .with_context(|| format!("opening chunkstore at {:?}", config.chunkstore.path))?,
        );
        let (inventory, inventory_worker) = Inventory::open(&config.inventory.path)
            .with_context(|| format!("opening inventory at {:?}", config.inventory.path))?;

        let chunk_size = config
            .debug
            .mocking
            .as_ref()
            .and_then(|m| m.chunksize)
            .unwrap_or(crate::chunk::DEFAULT_CHUNK_SIZE);
        let pool = ChunkPool::new(chunk_size);

        let mock_timings = config.debug.mocking.as_ref().map(|m| &m.timings);
        let changer_timings = crate::changer::mock::MockTimings {
            load: mock_timings.map(|t| t.load).unwrap_or_default(),
            unload: mock_timings.map(|t| t.unload).unwrap_or_default(),
        };
        let ltfs_timings = crate::ltfs::MockLtfsTimings {
            mount: mock_timings.map(|t| t.mount).unwrap_or_default(),
            unmount: mock_timings.map(|t| t.unmount).unwrap_or_default(),
            format: mock_timings.map(|t| t.format).unwrap_or_default(),
        };

        let peers: Arc<OnceLock<Vec<DriveHandle>>> = Arc::new(OnceLock::new());

        let mut changers = HashMap::new();
        let mut write_pool = Vec::new();
        let mut drive_threads = Vec::new();
        let mut group_members: HashMap<String, Vec<DriveHandle>> = HashMap::new();
        let mut group_aggregates: HashMap<String, (Sender<Chunk>, crossbeam_channel::Receiver<Chunk>)> =
            HashMap::new();

        for library in &config.libraries {
            let slot_count = (library.drives.len() as u64 * MOCK_SLOTS_PER_DRIVE).max(MIN_MOCK_SLOTS);
            let driver: Box<dyn ChangerDriver> = if mock || library.changer.kind == ChangerKind::Mock {
                Box::new(MockChanger::with_timings(
                    &library.name,
                    library.drives.len() as u64,
                    slot_count,
                    changer_timings,
                ))
            } else {
                Box::new(MtxChanger::new(library.changer.device.clone()))
            };
            let changer = Arc::new(Changer::new(driver));
            changers.insert(library.name.clone(), changer.clone());

            for drive_config in &library.drives {
                if drive_config.kind != DriveKind::Write {
                    // The read path is out of scope; see GET /obj's fixed
                    // 501 response in `api`.
                    continue;
                }

                let name = format!("{}/{}", library.name, drive_config.device);
                let kind_dir = match drive_config.kind {
                    DriveKind::Write => "write",
                    DriveKind::Read => "read",
                };
                let mount_root = config.ltfs.root.join(kind_dir);
                let ltfs: Box<dyn LtfsDriver> = if mock {
                    Box::new(MockLtfs::with_timings(mount_root, ltfs_timings))
                } else {
                    Box::new(ExternalLtfs::new(drive_config.device.clone(), mount_root))
                };

                let aggregate_rx = drive_config.group.as_ref().map(|group| {
                    group_aggregates
                        .entry(group.clone())
                        .or_insert_with(|| crossbeam_channel::unbounded())
                        .1
                        .clone()
                });

                let env = DriveEnvironment {
                    changer: changer.clone(),
                    inventory: inventory.clone(),
                    catalog: catalog.clone(),
                    library: library.name.clone(),
                    drive_slot: drive_config.slot as u64,
                    peers: peers.clone(),
                    mock_capacity: None,
                };

                let (handle, join) = drive::spawn(name, env, ltfs, drive::DEFAULT_MAX_ATTACHED, aggregate_rx);
                drive_threads.push(join);
                write_pool.push(handle.clone());

                if let Some(group) = &drive_config.group {
                    group_members.entry(group.clone()).or_default().push(handle);
                }
            }
        }

        // Every write drive has now been spawned; publish the flat pool so
        // a drive's hand-off race can offer a failed chunk to any peer.
        let _ = peers.set(write_pool.clone());

        let groups = group_members
            .into_iter()
            .map(|(name, members)| {
                let (tx, _rx) = group_aggregates
                    .remove(&name)
                    .expect("a group's aggregate channel is created alongside its first member");
                (name.clone(), DriveGroup::from_parts(name, members, tx))
            })
            .collect();

        Ok(Server {
            catalog,
            inventory,
            _inventory_worker: inventory_worker,
            pool,
            changers,
            write_pool,
            groups,
            _drive_threads: drive_threads,
        })
    }

    /// Register `archive` and acquire whatever drive(s) `policy` requires,
    /// returning a `Stream` ready for the caller to `write`/`close`.
    pub fn open_stream(
        &self,
        archive: impl Into<Arc<str>>,
        policy: Policy,
        deadline: Option<Instant>,
    ) -> Result<Stream, RequestError> {
        let archive = archive.into();
        self.catalog.create(&archive)?;

        if policy.parallel() {
            let group = self
                .groups
                .get(&policy.write_group)
                .ok_or_else(|| AdmissionError::UnknownWriteGroup(policy.write_group.clone()))?;
            let admission = group.acquire_all(policy.clone(), deadline)?;
            let out = admission.out.clone();
            let on_close = admission.on_close_hook();
            Ok(Stream::new(archive, policy, self.pool.clone(), out, on_close))
        } else {
            let admission = acquire::acquire(&self.write_pool, policy.clone(), deadline)?;
            let ingress = admission.ingress.clone();
            let on_close = admission.on_close_hook();
            Ok(Stream::new(archive, policy, self.pool.clone(), ingress, on_close))
        }
    }

    /// Re-synchronize the inventory with a library's changer: read its
    /// current element status and audit it in.
    pub fn audit(&self, library: &str) -> Result<(), RequestError> {
        let changer = self
            .changers
            .get(library)
            .ok_or_else(|| AdmissionError::UnknownLibrary(library.to_string()))?;
        let status: MtxStatus = changer.status()?;
        self.inventory.audit(status, library)?;
        Ok(())
    }

    /// Every known volume for `library`, as recorded in the inventory.
    pub fn list_volumes(&self, library: &str) -> Result<Vec<crate::inventory::Volume>, RequestError> {
        if !self.changers.contains_key(library) {
            return Err(AdmissionError::UnknownLibrary(library.to_string()).into());
        }
        Ok(self.inventory.volumes(library)?)
    }
}
