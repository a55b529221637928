//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use pacs_workqueue::builders::WorkQueueServiceBuilder;
use pacs_workqueue::config::{WorkQueueConfig, WorkQueueTypeProperties};
use pacs_workqueue::core::{DispatchOutcome, InMemoryAuditSink, InMemoryResourceLocks, ProcessorServices};
use pacs_workqueue::infra::persistence::{InMemoryCatalogue, PersistentStore, StudyStorage};
use pacs_workqueue::infra::queue::InMemoryWorkQueueStore;
use pacs_workqueue::infra::transport::DirectoryTransport;
use pacs_workqueue::runtime::WorkQueueService;
use pacs_workqueue::util::clock::ManualClock;
use pacs_workqueue::util::telemetry::init_tracing;

pub const START_MS: u64 = 1_700_000_000_000;

pub struct Harness {
    pub service: WorkQueueService,
    pub root: TempDir,
    pub clock: ManualClock,
    pub catalogue: Arc<InMemoryCatalogue>,
    pub queue: Arc<InMemoryWorkQueueStore>,
    pub locks: Arc<InMemoryResourceLocks>,
    pub audit: Arc<Mutex<InMemoryAuditSink>>,
    pub transport: Arc<DirectoryTransport>,
}

pub fn test_config(root: &TempDir) -> WorkQueueConfig {
    WorkQueueConfig::default()
        .with_worker_count(2)
        .with_scratch_directory(root.path().join("scratch"))
}

impl Harness {
    pub fn new() -> Self {
        Self::build(|config| config, |builder| builder)
    }

    pub fn with_properties(props: WorkQueueTypeProperties) -> Self {
        Self::build(
            move |mut config| {
                config.default_properties = props;
                config
            },
            |builder| builder,
        )
    }

    pub fn build(
        configure: impl FnOnce(WorkQueueConfig) -> WorkQueueConfig,
        customize: impl FnOnce(WorkQueueServiceBuilder) -> WorkQueueServiceBuilder,
    ) -> Self {
        init_tracing();
        let root = TempDir::new().unwrap();
        let config = configure(test_config(&root));
        let clock = ManualClock::new(START_MS);
        let catalogue = Arc::new(InMemoryCatalogue::new());
        let queue = Arc::new(InMemoryWorkQueueStore::new(config.max_queue_depth));
        let locks = Arc::new(InMemoryResourceLocks::new());
        let audit = Arc::new(Mutex::new(InMemoryAuditSink::new(1_000)));
        let transport = Arc::new(DirectoryTransport::new());

        let builder = WorkQueueServiceBuilder::new(config)
            .with_clock(Arc::new(clock.clone()))
            .with_catalogue(catalogue.clone())
            .with_queue(queue.clone())
            .with_locks(locks.clone())
            .with_audit(audit.clone())
            .with_transport(transport.clone());
        let service = customize(builder).build().unwrap();

        Self {
            service,
            root,
            clock,
            catalogue,
            queue,
            locks,
            audit,
            transport,
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    pub fn services(&self) -> Arc<ProcessorServices> {
        Arc::clone(self.service.scheduler().services())
    }

    /// Register a study row whose folder lives under `studies/<key>`.
    pub fn seed_study(&self, key: &str) -> PathBuf {
        self.seed_study_at(key, self.path("studies").join(key), "fast")
    }

    pub fn seed_study_at(&self, key: &str, study_path: PathBuf, tier: &str) -> PathBuf {
        let row = StudyStorage {
            key: key.into(),
            study_instance_uid: format!("1.2.840.{key}"),
            study_path: study_path.clone(),
            instance_count: 0,
            size_bytes: 0,
            tier: tier.into(),
        };
        self.catalogue.seed(StudyStorage::TABLE, key, row.to_value());
        study_path
    }

    pub fn study(&self, key: &str) -> Option<StudyStorage> {
        self.catalogue
            .find(StudyStorage::TABLE, key)
            .map(|v| StudyStorage::from_value(key, v).unwrap())
    }

    /// Write a received file into `incoming/`.
    pub fn incoming(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let dir = self.path("incoming");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    pub fn incoming_data(&self) -> serde_json::Value {
        json!({ "incoming_dir": self.path("incoming") })
    }

    pub fn dispatch(&self) -> DispatchOutcome {
        self.service.dispatch_once("test-worker").unwrap()
    }

    /// Dispatch until nothing is due.
    pub fn drain(&self) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..100 {
            match self.dispatch() {
                DispatchOutcome::NoWork => return outcomes,
                outcome => outcomes.push(outcome),
            }
        }
        panic!("queue did not drain: {outcomes:?}");
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn actions(&self, key: &pacs_workqueue::util::serde::WorkItemKey) -> Vec<String> {
        self.audit.lock().actions_for(&key.to_string())
    }
}
