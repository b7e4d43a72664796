//! Fakes for driving the pipeline without a model endpoint or a bucket.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genqueue::{
    db::{InMemoryJobStore, JobStore},
    models::job::GenerationJob,
    services::{
        catalog::ModelCatalog,
        inference::{GeneratedImage, InferenceClient, InferenceError},
        scheduler::{Scheduler, SchedulerConfig},
        storage::{artifact_key, sniff_format, ArtifactStore, StorageError, StoredArtifact},
    },
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// PNG signature plus a little padding; enough for format sniffing.
pub const PNG_BYTES: &[u8] = &[
    0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n', 0, 0, 0, 13, b'I', b'H', b'D', b'R',
];

/// Inference fake that replays scripted failures, then succeeds with PNG bytes.
#[derive(Default)]
pub struct ScriptedInference {
    failures: Mutex<VecDeque<InferenceError>>,
    seen: Mutex<Vec<GenerationJob>>,
    delay: Duration,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(errors: impl IntoIterator<Item = InferenceError>) -> Self {
        Self {
            failures: Mutex::new(errors.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Succeed, but only after `delay`, like a slow model.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn seen(&self) -> Vec<GenerationJob> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn generate(&self, job: &GenerationJob) -> Result<GeneratedImage, InferenceError> {
        self.seen.lock().push(job.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let catalog = ModelCatalog::default();
        let profile = catalog
            .resolve(&job.model)
            .ok_or_else(|| InferenceError::UnknownModel(job.model.clone()))?;
        let resolved = ModelCatalog::normalize(&profile, &job.parameters);

        Ok(GeneratedImage {
            bytes: PNG_BYTES.to_vec(),
            content_type: "image/png".to_string(),
            parameters: (&resolved).into(),
        })
    }
}

/// Object store fake keeping uploads in memory.
#[derive(Default)]
pub struct MemoryArtifacts {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<VecDeque<StorageError>>,
    puts: Mutex<usize>,
}

impl MemoryArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(errors: impl IntoIterator<Item = StorageError>) -> Self {
        Self {
            failures: Mutex::new(errors.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }

    pub fn puts(&self) -> usize {
        *self.puts.lock()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn upload(
        &self,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
        bytes: &[u8],
    ) -> Result<StoredArtifact, StorageError> {
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let (extension, content_type) = sniff_format(bytes);
        let key = artifact_key(user_id, timestamp, extension);
        self.objects.lock().insert(key.clone(), bytes.to_vec());
        *self.puts.lock() += 1;

        Ok(StoredArtifact {
            url: format!("https://cdn.test/{key}"),
            path: key,
            content_type: content_type.to_string(),
            byte_len: bytes.len(),
        })
    }
}

pub const TEST_LEASE: Duration = Duration::from_secs(60);

pub fn test_config(max_retries: i32) -> SchedulerConfig {
    SchedulerConfig {
        worker_id: "test-worker".to_string(),
        poll_interval: Duration::from_millis(10),
        max_retries,
        lease: TEST_LEASE,
        reap_interval: Duration::from_secs(1),
        concurrency: 1,
    }
}

/// Everything a pipeline test needs, wired to the fakes.
pub struct Harness {
    pub store: Arc<InMemoryJobStore>,
    pub inference: Arc<ScriptedInference>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub scheduler: Arc<Scheduler>,
}

impl Harness {
    pub fn new(inference: ScriptedInference, artifacts: MemoryArtifacts) -> Self {
        Self::with_config(test_config(3), inference, artifacts)
    }

    pub fn with_config(
        config: SchedulerConfig,
        inference: ScriptedInference,
        artifacts: MemoryArtifacts,
    ) -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        let inference = Arc::new(inference);
        let artifacts = Arc::new(artifacts);
        let scheduler = Arc::new(Scheduler::new(
            config,
            Arc::clone(&store) as Arc<dyn JobStore>,
            Arc::clone(&inference) as Arc<dyn InferenceClient>,
            Arc::clone(&artifacts) as Arc<dyn ArtifactStore>,
        ));

        Self {
            store,
            inference,
            artifacts,
            scheduler,
        }
    }

    pub async fn job(&self, job_id: Uuid) -> GenerationJob {
        self.store
            .get_job(job_id)
            .await
            .expect("store read failed")
            .expect("job missing")
    }
}
