// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Dataset and pool-level namespace management.
//!
//! The meta objset's first objects are fixed: object 1 is the dataset
//! directory (name to object id), objects 2..=5 back the dedup table.
//! Each dataset object's data is its phys: the objset root pointer plus
//! its properties. The meta objset is only ever mutated in syncing
//! context; namespace changes ride sync tasks, batches of (check, sync)
//! pairs that execute atomically against one txg.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::blkptr::{BlockPtr, ObjType, BP_SIZE};
use crate::ddt::DdtStoreSet;
use crate::dmu::{self, DatasetProps, Objset, ObjsetPhys, DEFAULT_DATA_BLKSZ, META_DATA_BLKSZ};
use crate::error::{Error, Result};
use crate::spa::PoolCore;
use crate::zil::Zilog;
use crate::zio::CryptCtx;
use tp_checksum::ChecksumId;
use tp_compress::CompressId;

pub const MOS_OBJSET_ID: u64 = 0;
pub const MOS_OBJ_DIR: u64 = 1;
pub const MOS_OBJ_DDT_DUP: u64 = 2;
pub const MOS_OBJ_DDT_UNIQUE: u64 = 3;
pub const MOS_OBJ_DDT_LOG0: u64 = 4;
pub const MOS_OBJ_DDT_LOG1: u64 = 5;
/// Dataset objset ids are their MOS object number.
pub const FIRST_DATASET_OBJ: u64 = 6;

pub fn ddt_store_set() -> DdtStoreSet {
    DdtStoreSet {
        dup_obj: MOS_OBJ_DDT_DUP,
        unique_obj: MOS_OBJ_DDT_UNIQUE,
        log_objs: [MOS_OBJ_DDT_LOG0, MOS_OBJ_DDT_LOG1],
    }
}

/// Operator-facing dataset properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatasetConfig {
    pub checksum: String,
    pub compress: String,
    pub dedup: bool,
    pub copies: usize,
    /// Mechanism name, e.g. "CKM_AES_GCM"; empty = plaintext.
    pub encryption: String,
    /// Hex key material when encrypted.
    pub key_hex: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig {
            checksum: "on".into(),
            compress: "on".into(),
            dedup: false,
            copies: 1,
            encryption: String::new(),
            key_hex: String::new(),
        }
    }
}

impl DatasetConfig {
    pub fn resolve(&self) -> Result<(DatasetProps, Option<Arc<CryptCtx>>)> {
        let checksum = match self.checksum.as_str() {
            "on" => ChecksumId::Fletcher4,
            "off" => ChecksumId::Off,
            "fletcher2" => ChecksumId::Fletcher2,
            "fletcher4" => ChecksumId::Fletcher4,
            "sha256" => ChecksumId::Sha256,
            other => return Err(Error::Config(format!("unknown checksum '{}'", other))),
        };
        let compress = match self.compress.as_str() {
            "on" => CompressId::Lzjb,
            "off" => CompressId::Off,
            "lzjb" => CompressId::Lzjb,
            "zle" => CompressId::Zle,
            other => {
                let parsed = other
                    .strip_prefix("gzip-")
                    .and_then(|lvl| lvl.parse::<u8>().ok())
                    .filter(|lvl| (1..=9).contains(lvl))
                    .map(|lvl| CompressId::from_u8(CompressId::Gzip1 as u8 + lvl - 1));
                match parsed {
                    Some(Ok(id)) => id,
                    _ => return Err(Error::Config(format!("unknown compress '{}'", other))),
                }
            }
        };
        if self.dedup && checksum != ChecksumId::Sha256 {
            return Err(Error::Config("dedup requires checksum=sha256".into()));
        }
        if self.copies == 0 || self.copies > 3 {
            return Err(Error::Config("copies must be 1..=3".into()));
        }
        let crypt = if self.encryption.is_empty() {
            None
        } else {
            tp_crypto::init_default_providers();
            let mech = tp_crypto::mech_from_name(&self.encryption)?;
            let key = hex::decode(&self.key_hex)
                .map_err(|_| Error::Config("bad key_hex".into()))?;
            let template = tp_crypto::create_ctx_template(mech, &key)?;
            // The salt seeds every block's associated data.
            let salt = key.iter().fold(SALT_SEED, |acc, b| {
                acc.wrapping_mul(0x100_0000_01b3) ^ u64::from(*b)
            });
            Some(Arc::new(CryptCtx { template, salt }))
        };
        Ok((
            DatasetProps {
                checksum,
                compress,
                dedup: self.dedup,
                copies: self.copies,
            },
            crypt,
        ))
    }
}

const SALT_SEED: u64 = 0xcbf2_9ce4_8422_2325;

/// Per-dataset record stored in its MOS object.
pub struct DatasetPhys {
    pub rootbp: BlockPtr,
    pub config: DatasetConfig,
}

impl DatasetPhys {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(&self.config).map_err(|e| Error::Config(e.to_string()))?;
        let mut out = vec![0u8; BP_SIZE + 4 + json.len()];
        self.rootbp.encode(&mut out[0..BP_SIZE]);
        LittleEndian::write_u32(&mut out[BP_SIZE..BP_SIZE + 4], json.len() as u32);
        out[BP_SIZE + 4..].copy_from_slice(&json);
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<DatasetPhys> {
        if buf.len() < BP_SIZE + 4 {
            return Err(Error::Label("short dataset phys"));
        }
        let rootbp = BlockPtr::decode(&buf[0..BP_SIZE])?;
        let len = LittleEndian::read_u32(&buf[BP_SIZE..BP_SIZE + 4]) as usize;
        let config = serde_json::from_slice(&buf[BP_SIZE + 4..BP_SIZE + 4 + len])
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(DatasetPhys { rootbp, config })
    }
}

/// An open dataset: its objset plus its intent log.
pub struct Dataset {
    pub name: String,
    pub object: u64,
    pub os: Arc<Objset>,
    pub zilog: Arc<Zilog>,
}

type CheckFn = Box<dyn FnMut(u64) -> Result<()> + Send>;
type SyncFn = Box<dyn FnMut(u64) -> Result<()> + Send>;

struct PendingTask {
    check: CheckFn,
    sync: SyncFn,
    done: Sender<Result<()>>,
}

/// The pool-level dataset layer.
pub struct DslPool {
    pub mos: Arc<Objset>,
    datasets: Mutex<HashMap<String, Arc<Dataset>>>,
    tasks: Mutex<Vec<PendingTask>>,
}

impl DslPool {
    /// Fresh pool: build the meta objset and its fixed objects.
    pub fn create(pool: &Arc<PoolCore>, txg: u64) -> Result<DslPool> {
        let mos = Objset::create(
            MOS_OBJSET_ID,
            DatasetProps {
                checksum: ChecksumId::Fletcher4,
                compress: CompressId::Lzjb,
                dedup: false,
                copies: 1,
            },
            None,
        );
        for expect in MOS_OBJ_DIR..=MOS_OBJ_DDT_LOG1 {
            let got = dmu::object_alloc_sync(pool, &mos, txg, ObjType::Directory, META_DATA_BLKSZ)?;
            if got != expect {
                return Err(Error::Config(format!(
                    "meta objset layout: expected object {}, got {}",
                    expect, got
                )));
            }
        }
        let dir: HashMap<String, u64> = HashMap::new();
        dmu::dmu_write_sync(
            pool,
            &mos,
            txg,
            MOS_OBJ_DIR,
            0,
            &serde_json::to_vec(&dir).unwrap(),
        )?;
        Ok(DslPool {
            mos,
            datasets: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Import: rehydrate the meta objset from its root pointer.
    pub fn open(pool: &Arc<PoolCore>, rootbp: BlockPtr) -> Result<DslPool> {
        let bytes = pool
            .read_block(&rootbp, None, crate::arc::BufType::Metadata, None, false)
            .map_err(Error::from)?;
        let phys = ObjsetPhys::decode(&bytes)?;
        let mos = Objset::open(
            MOS_OBJSET_ID,
            phys,
            rootbp,
            DatasetProps {
                checksum: ChecksumId::Fletcher4,
                compress: CompressId::Lzjb,
                dedup: false,
                copies: 1,
            },
            None,
        );
        Ok(DslPool {
            mos,
            datasets: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn read_dir(&self, pool: &Arc<PoolCore>) -> Result<HashMap<String, u64>> {
        let bytes = dmu::dmu_read_all(pool, &self.mos, MOS_OBJ_DIR)?;
        if bytes.is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| Error::Config(e.to_string()))
    }

    /// Register a (check, sync) pair to run atomically in the next
    /// syncing txg. The receiver resolves when the batch ran.
    pub fn register_sync_task(&self, check: CheckFn, sync: SyncFn) -> Receiver<Result<()>> {
        let (tx, rx) = bounded(1);
        self.tasks.lock().unwrap().push(PendingTask {
            check,
            sync,
            done: tx,
        });
        rx
    }

    /// Run queued sync tasks in syncing context. A task whose check
    /// vetoes reports the error and mutates nothing.
    pub fn run_sync_tasks(&self, txg: u64) {
        let tasks: Vec<PendingTask> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for mut task in tasks {
            let result = match (task.check)(txg) {
                Ok(()) => (task.sync)(txg),
                Err(e) => Err(e),
            };
            let _ = task.done.send(result);
        }
    }

    /// Create a dataset; durable when this returns.
    pub fn create_dataset(
        self: &Arc<Self>,
        pool: &Arc<PoolCore>,
        name: &str,
        config: DatasetConfig,
    ) -> Result<Arc<Dataset>> {
        // Validate eagerly; configuration errors are synchronous.
        config.resolve()?;
        let this = Arc::clone(self);
        let check_pool = Arc::clone(pool);
        let check_name = name.to_string();
        let sync_pool = Arc::clone(pool);
        let sync_name = name.to_string();
        let sync_cfg = config;
        let this_sync = Arc::clone(self);
        let rx = self.register_sync_task(
            Box::new(move |_txg| {
                let dir = this.read_dir(&check_pool)?;
                if dir.contains_key(&check_name) {
                    return Err(Error::DatasetExists(check_name.clone()));
                }
                Ok(())
            }),
            Box::new(move |txg| {
                let mut dir = this_sync.read_dir(&sync_pool)?;
                let object = dmu::object_alloc_sync(
                    &sync_pool,
                    &this_sync.mos,
                    txg,
                    ObjType::Directory,
                    META_DATA_BLKSZ,
                )?;
                let phys = DatasetPhys {
                    rootbp: BlockPtr::default(),
                    config: sync_cfg.clone(),
                };
                dmu::dmu_rewrite_sync(&sync_pool, &this_sync.mos, txg, object, &phys.encode()?)?;
                dir.insert(sync_name.clone(), object);
                dmu::dmu_rewrite_sync(
                    &sync_pool,
                    &this_sync.mos,
                    txg,
                    MOS_OBJ_DIR,
                    &serde_json::to_vec(&dir).unwrap(),
                )?;
                info!("created dataset '{}' (object {})", sync_name, object);
                Ok(())
            }),
        );
        pool.txg_kick_and_wait();
        rx.recv().map_err(|_| Error::Busy("sync task lost"))??;
        self.open_dataset(pool, name)
    }

    /// Open (or fetch the already-open) dataset.
    pub fn open_dataset(
        self: &Arc<Self>,
        pool: &Arc<PoolCore>,
        name: &str,
    ) -> Result<Arc<Dataset>> {
        {
            let datasets = self.datasets.lock().unwrap();
            if let Some(ds) = datasets.get(name) {
                return Ok(Arc::clone(ds));
            }
        }
        let dir = self.read_dir(pool)?;
        let object = *dir
            .get(name)
            .ok_or_else(|| Error::NoSuchDataset(name.to_string()))?;
        let phys = DatasetPhys::decode(&dmu::dmu_read_all(pool, &self.mos, object)?)?;
        let (props, crypt) = phys.config.resolve()?;
        let os = if phys.rootbp.is_hole() {
            Objset::create(object, props, crypt)
        } else {
            let bytes = pool
                .read_block(
                    &phys.rootbp,
                    crypt.clone(),
                    crate::arc::BufType::Metadata,
                    None,
                    false,
                )
                .map_err(Error::from)?;
            Objset::open(object, ObjsetPhys::decode(&bytes)?, phys.rootbp, props, crypt)
        };
        let ds = Arc::new(Dataset {
            name: name.to_string(),
            object,
            os,
            zilog: Arc::new(Zilog::new(object)),
        });
        self.datasets
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&ds));
        debug!("opened dataset '{}'", name);
        Ok(ds)
    }

    /// Destroy a dataset: free every object, the objset root, and the
    /// directory entry, atomically in one txg.
    pub fn destroy_dataset(self: &Arc<Self>, pool: &Arc<PoolCore>, name: &str) -> Result<()> {
        let ds = self.open_dataset(pool, name)?;
        let this = Arc::clone(self);
        let check_name = name.to_string();
        let this_sync = Arc::clone(self);
        let sync_pool = Arc::clone(pool);
        let sync_name = name.to_string();
        let ds_sync = Arc::clone(&ds);
        let check_pool = Arc::clone(pool);
        let rx = self.register_sync_task(
            Box::new(move |_txg| {
                let dir = this.read_dir(&check_pool)?;
                if !dir.contains_key(&check_name) {
                    return Err(Error::NoSuchDataset(check_name.clone()));
                }
                Ok(())
            }),
            Box::new(move |txg| {
                // Free every block the objset references, then its root.
                dmu::objset_free_all(&sync_pool, &ds_sync.os, txg)?;
                let rootbp = ds_sync.os.last_rootbp.lock().unwrap().clone();
                if !rootbp.is_hole() {
                    let free = crate::zio::Zio::free(Arc::clone(&sync_pool), rootbp, txg);
                    let _ = free.wait();
                }
                let mut dir = this_sync.read_dir(&sync_pool)?;
                dir.remove(&sync_name);
                dmu::dmu_rewrite_sync(
                    &sync_pool,
                    &this_sync.mos,
                    txg,
                    MOS_OBJ_DIR,
                    &serde_json::to_vec(&dir).unwrap(),
                )?;
                sync_pool.dbufs.evict_objset(ds_sync.object);
                info!("destroyed dataset '{}'", sync_name);
                Ok(())
            }),
        );
        pool.txg_kick_and_wait();
        rx.recv().map_err(|_| Error::Busy("sync task lost"))??;
        self.datasets.lock().unwrap().remove(name);
        Ok(())
    }

    pub fn list_datasets(&self, pool: &Arc<PoolCore>) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.read_dir(pool)?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn open_datasets(&self) -> Vec<Arc<Dataset>> {
        self.datasets.lock().unwrap().values().cloned().collect()
    }

    /// Sync one dataset's dirty state and record its new root.
    pub fn sync_dataset(
        &self,
        pool: &Arc<PoolCore>,
        ds: &Arc<Dataset>,
        txg: u64,
    ) -> Result<()> {
        if !ds.os.is_dirty(txg) && !zil_header_dirty(ds) {
            return Ok(());
        }
        let rootbp = dmu::objset_sync(pool, &ds.os, txg)?;
        let old = dmu::dmu_read_all(pool, &self.mos, ds.object)?;
        let mut phys = DatasetPhys::decode(&old)?;
        phys.rootbp = rootbp;
        dmu::dmu_rewrite_sync(pool, &self.mos, txg, ds.object, &phys.encode()?)?;
        Ok(())
    }

    /// Sync the meta objset itself; returns the new pool root pointer.
    pub fn sync_mos(&self, pool: &Arc<PoolCore>, txg: u64) -> Result<BlockPtr> {
        dmu::objset_sync(pool, &self.mos, txg)
    }

    /// The default data object block size for new objects.
    pub fn default_blksz() -> u32 {
        DEFAULT_DATA_BLKSZ
    }
}

fn zil_header_dirty(_ds: &Arc<Dataset>) -> bool {
    // The header is rewritten with the objset on every sync; a separate
    // dirty bit is not tracked.
    false
}
