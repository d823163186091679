//! IndexService: the collection registry and its background loops.
//!
//! Lifecycle follows `CREATED → INITIALIZED → STARTED → INITIALIZED →
//! CREATED`; every operation requires `STARTED`. Flush and optimize are two
//! long-lived tasks on a service-owned scheduler, cancelled by flipping a
//! flag and signaling a notifier.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use quiver_core::config::IndexConfig;
use quiver_core::error::{Error, Result};
use quiver_core::meta::CollectionMeta;
use quiver_core::proto::CollectionDataset;
use quiver_core::service::{ServiceState, ServiceStatus};
use quiver_executor::task::ClosureTask;
use quiver_executor::{Scheduler, WaitNotifier};

use crate::collection::{Collection, CollectionStats, ReadOptions, MANIFEST_FILE};
use crate::segment::{Segment, SegmentRef};

/// Collection registry with background flush/optimize loops.
pub struct IndexService {
    state: ServiceState,
    config: IndexConfig,
    collections: Arc<DashMap<String, Arc<Collection>>>,
    pool: Mutex<Option<Arc<Scheduler>>>,
    flush_flag: Arc<AtomicBool>,
    flush_notifier: Arc<WaitNotifier>,
    optimize_flag: Arc<AtomicBool>,
    optimize_notifier: Arc<WaitNotifier>,
}

impl IndexService {
    /// Service in `CREATED`.
    pub fn new(config: IndexConfig) -> Self {
        IndexService {
            state: ServiceState::new(),
            config,
            collections: Arc::new(DashMap::new()),
            pool: Mutex::new(None),
            flush_flag: Arc::new(AtomicBool::new(false)),
            flush_notifier: Arc::new(WaitNotifier::new()),
            optimize_flag: Arc::new(AtomicBool::new(false)),
            optimize_notifier: Arc::new(WaitNotifier::new()),
        }
    }

    /// Current lifecycle phase.
    pub fn status(&self) -> ServiceStatus {
        self.state.status()
    }

    /// Config snapshot.
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Acquire resources: `CREATED → INITIALIZED`.
    pub fn init(&self) -> Result<()> {
        self.state.ensure(ServiceStatus::Created)?;
        if self.config.index_directory.is_empty() {
            error!("load config failed");
            return Err(Error::LoadConfig("index_directory is empty".into()));
        }
        std::fs::create_dir_all(&self.config.index_directory)?;
        *self.pool.lock() = Some(Arc::new(Scheduler::new(
            self.config.dump_thread_count as usize,
        )));
        self.state
            .transition(ServiceStatus::Created, ServiceStatus::Initialized)?;
        info!("index service initialize complete");
        Ok(())
    }

    /// Start serving: `INITIALIZED → STARTED`; submits the background loops.
    pub fn start(&self) -> Result<()> {
        self.state
            .transition(ServiceStatus::Initialized, ServiceStatus::Started)?;

        // stop() tears the pool down; a restart needs a fresh one
        let pool = {
            let mut guard = self.pool.lock();
            if guard.is_none() {
                *guard = Some(Arc::new(Scheduler::new(
                    self.config.dump_thread_count as usize,
                )));
            }
            guard.clone().expect("pool just ensured")
        };

        if self.config.flush_interval_secs > 0 {
            self.flush_flag.store(true, Ordering::Release);
            let task = Self::routine_task(
                "routine-flush",
                self.collections.clone(),
                self.flush_flag.clone(),
                self.flush_notifier.clone(),
                Duration::from_secs(self.config.flush_interval_secs),
                |collection| collection.flush(),
            );
            pool.schedule(task)?;
        }
        if self.config.optimize_interval_secs > 0 {
            self.optimize_flag.store(true, Ordering::Release);
            let task = Self::routine_task(
                "routine-optimize",
                self.collections.clone(),
                self.optimize_flag.clone(),
                self.optimize_notifier.clone(),
                Duration::from_secs(self.config.optimize_interval_secs),
                |collection| collection.optimize(),
            );
            pool.schedule(task)?;
        }

        info!("index service start complete");
        Ok(())
    }

    /// Stop serving: `STARTED → INITIALIZED`; cancels the loops and closes
    /// every collection.
    pub fn stop(&self) -> Result<()> {
        self.state
            .transition(ServiceStatus::Started, ServiceStatus::Initialized)?;

        self.flush_flag.store(false, Ordering::Release);
        self.flush_notifier.notify();
        self.optimize_flag.store(false, Ordering::Release);
        self.optimize_notifier.notify();

        if let Some(pool) = self.pool.lock().take() {
            pool.stop();
        }

        for entry in self.collections.iter() {
            if let Err(err) = entry.value().close() {
                warn!(collection = entry.key().as_str(), code = err.code(), "close failed");
            }
        }
        self.collections.clear();

        info!("index service stopped");
        Ok(())
    }

    /// Release resources: `INITIALIZED → CREATED`.
    pub fn cleanup(&self) -> Result<()> {
        self.state
            .transition(ServiceStatus::Initialized, ServiceStatus::Created)?;
        *self.pool.lock() = None;
        info!("index service cleanup complete");
        Ok(())
    }

    fn routine_task(
        name: &str,
        collections: Arc<DashMap<String, Arc<Collection>>>,
        flag: Arc<AtomicBool>,
        notifier: Arc<WaitNotifier>,
        interval: Duration,
        action: impl Fn(&Collection) -> Result<()> + Send + Sync + 'static,
    ) -> Arc<ClosureTask> {
        let task_name = name.to_string();
        ClosureTask::new(name, move || {
            loop {
                if !flag.load(Ordering::Acquire) {
                    info!(task = task_name.as_str(), "exited background loop");
                    break;
                }
                for entry in collections.iter() {
                    if let Err(err) = action(entry.value().as_ref()) {
                        // Background failures are logged; the loop continues
                        warn!(
                            task = task_name.as_str(),
                            collection = entry.key().as_str(),
                            code = err.code(),
                            "background pass failed"
                        );
                    }
                }
                notifier.wait_for(interval);
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Collection operations (all require STARTED)
    // ------------------------------------------------------------------

    /// Create a collection, or open its existing on-disk state when a
    /// manifest is already present.
    pub fn create_collection(&self, name: &str, schema: &CollectionMeta) -> Result<()> {
        self.state.ensure(ServiceStatus::Started)?;

        if self.collections.contains_key(name) {
            error!(collection = name, "collection already exists, create failed");
            return Err(Error::DuplicateCollection(name.to_string()));
        }

        // Existing manifest means load, otherwise create new state
        let manifest_path = Path::new(&self.config.index_directory)
            .join(name)
            .join(MANIFEST_FILE);
        let options = ReadOptions {
            create_new: !manifest_path.exists(),
            use_mmap: self.config.use_mmap_read,
        };

        let collection = Collection::create_and_open(
            name,
            &self.config.index_directory,
            schema.clone(),
            options,
        )?;
        self.collections.insert(name.to_string(), collection);
        info!(collection = name, "create new collection success");
        Ok(())
    }

    /// Load a set of collections from storage (startup restore).
    pub fn load_collections(&self, schemas: &[CollectionMeta]) -> Result<()> {
        self.state.ensure(ServiceStatus::Started)?;
        for schema in schemas {
            let collection = Collection::create_and_open(
                &schema.name,
                &self.config.index_directory,
                schema.clone(),
                ReadOptions {
                    create_new: false,
                    use_mmap: self.config.use_mmap_read,
                },
            )?;
            self.collections.insert(schema.name.clone(), collection);
            info!(collection = schema.name.as_str(), "load collection success");
        }
        Ok(())
    }

    /// Drop a collection and its on-disk state.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.state.ensure(ServiceStatus::Started)?;
        let (_, collection) = self
            .collections
            .remove(name)
            .ok_or_else(|| Error::InexistentCollection(name.to_string()))?;
        collection.close_and_cleanup()?;
        info!(collection = name, "drop collection success");
        Ok(())
    }

    /// Forward a schema update to the collection.
    pub fn update_collection(&self, name: &str, new_schema: &CollectionMeta) -> Result<()> {
        self.state.ensure(ServiceStatus::Started)?;
        self.get(name)?.update_schema(new_schema.clone())
    }

    /// Existence check.
    pub fn has_collection(&self, name: &str) -> bool {
        self.state.ensure(ServiceStatus::Started).is_ok() && self.collections.contains_key(name)
    }

    /// Names of all collections.
    pub fn list_collections(&self) -> Result<Vec<String>> {
        self.state.ensure(ServiceStatus::Started)?;
        Ok(self.collections.iter().map(|e| e.key().clone()).collect())
    }

    /// Segments of a collection, in rollover order.
    pub fn list_segments(&self, name: &str) -> Result<Vec<SegmentRef>> {
        self.state.ensure(ServiceStatus::Started)?;
        Ok(self.get(name)?.segments())
    }

    /// Statistics snapshot of a collection.
    pub fn get_collection_stats(&self, name: &str) -> Result<CollectionStats> {
        self.state.ensure(ServiceStatus::Started)?;
        Ok(self.get(name)?.stats())
    }

    /// Latest `(lsn, lsn_context)` observed by a collection.
    pub fn get_latest_lsn(&self, name: &str) -> Result<(u64, String)> {
        self.state.ensure(ServiceStatus::Started)?;
        Ok(self.get(name)?.latest_lsn())
    }

    /// Route a write batch to a collection.
    pub fn write_records(&self, name: &str, dataset: &CollectionDataset) -> Result<()> {
        self.state.ensure(ServiceStatus::Started)?;
        self.get(name)?.write_records(dataset)
    }

    fn get(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                error!(collection = name, "collection not exist");
                Error::InexistentCollection(name.to_string())
            })
    }
}

impl Drop for IndexService {
    fn drop(&mut self) {
        if self.state.status() == ServiceStatus::Started {
            let _ = self.stop();
        }
    }
}
