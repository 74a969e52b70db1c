//! In-memory collaborators for pipeline tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use studio_pipeline::app_state::AppState;
use studio_pipeline::config::PipelineSettings;
use studio_pipeline::db::store::{AssetStore, EntityStore, JobStore};
use studio_pipeline::models::asset::{Asset, NewAsset};
use studio_pipeline::models::entity::{EntityStatus, OwnerRef, OwningEntity};
use studio_pipeline::models::job::{Job, JobStatus, NewJob};
use studio_pipeline::services::fetch::{FetchError, FetchedImage, ImageFetcher};
use studio_pipeline::services::normalizer::ProviderOutput;
use studio_pipeline::services::provider::{ImageProvider, ProviderError};
use studio_pipeline::services::storage::{ObjectStorage, StorageError};

/// Job table with the same transition rules as the SQL queries, plus a
/// switch that makes the next outcome writes fail.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<Job>>,
    failing_writes: AtomicUsize,
}

impl MemoryJobStore {
    /// Fail the next `count` calls to `mark_done` or `record_failure`.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn take_write_failure(&self) -> Result<(), sqlx::Error> {
        let remaining = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(sqlx::Error::PoolTimedOut),
            Err(_) => Ok(()),
        }
    }

    pub fn job(&self, id: Uuid) -> Job {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .expect("job exists")
    }

    pub fn all(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().clone()
    }

    /// Make a backed-off job claimable now.
    pub fn release(&self, id: Uuid) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.available_at = None;
        }
    }

    fn update<T>(&self, id: Uuid, f: impl FnOnce(&mut Job) -> T) -> Option<T> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.iter_mut().find(|j| j.id == id).map(f)
    }
}

fn is_active(status: JobStatus) -> bool {
    matches!(status, JobStatus::Queued | JobStatus::Running)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: &NewJob) -> Result<Job, sqlx::Error> {
        let now = Utc::now();
        let row = Job {
            id: Uuid::new_v4(),
            job_type: job.job_type.clone(),
            subject_id: job.subject_id,
            photoshoot_id: job.photoshoot_id,
            payload: job.payload.clone(),
            status: JobStatus::Queued,
            attempts: 0,
            available_at: None,
            locked_by: None,
            locked_at: None,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };
        self.jobs.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, sqlx::Error> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs
            .iter_mut()
            .filter(|j| j.is_eligible(now))
            .min_by_key(|j| j.created_at)
        else {
            return Ok(None);
        };

        job.status = JobStatus::Running;
        job.locked_by = Some(worker_id.to_string());
        job.locked_at = Some(now);
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
        Ok(self.update(job_id, |j| j.clone()))
    }

    async fn mark_done(&self, job_id: Uuid, result: &Value) -> Result<bool, sqlx::Error> {
        self.take_write_failure()?;
        Ok(self
            .update(job_id, |j| {
                if j.status != JobStatus::Running {
                    return false;
                }
                j.status = JobStatus::Done;
                j.result = Some(result.clone());
                j.error = None;
                j.locked_by = None;
                j.finished_at = Some(Utc::now());
                true
            })
            .unwrap_or(false))
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        seen_attempts: i32,
        requeue_at: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        self.take_write_failure()?;
        Ok(self
            .update(job_id, |j| {
                if !is_active(j.status) || j.attempts != seen_attempts {
                    return false;
                }
                j.attempts += 1;
                j.error = Some(error.to_string());
                j.locked_by = None;
                match requeue_at {
                    Some(at) => {
                        j.status = JobStatus::Queued;
                        j.available_at = Some(at);
                        j.locked_at = None;
                    }
                    None => {
                        j.status = JobStatus::Failed;
                        j.finished_at = Some(Utc::now());
                    }
                }
                true
            })
            .unwrap_or(false))
    }

    async fn queue_depth(&self) -> Result<i64, sqlx::Error> {
        let now = Utc::now();
        Ok(self.jobs.lock().unwrap().iter().filter(|j| j.is_eligible(now)).count() as i64)
    }

    async fn health_check(&self) -> Result<(), sqlx::Error> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryEntityStore {
    entities: Mutex<HashMap<OwnerRef, OwningEntity>>,
}

impl MemoryEntityStore {
    pub fn insert(&self, entity: OwningEntity) {
        self.entities.lock().unwrap().insert(entity.owner, entity);
    }

    pub fn get(&self, owner: OwnerRef) -> OwningEntity {
        self.entities
            .lock()
            .unwrap()
            .get(&owner)
            .cloned()
            .expect("entity exists")
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get_entity(&self, owner: OwnerRef) -> Result<Option<OwningEntity>, sqlx::Error> {
        Ok(self.entities.lock().unwrap().get(&owner).cloned())
    }

    async fn append_assets(
        &self,
        owner: OwnerRef,
        asset_ids: &[Uuid],
        status: EntityStatus,
    ) -> Result<(), sqlx::Error> {
        if let Some(entity) = self.entities.lock().unwrap().get_mut(&owner) {
            entity.asset_ids.extend_from_slice(asset_ids);
            entity.status = status.to_string();
        }
        Ok(())
    }

    async fn set_status(&self, owner: OwnerRef, status: EntityStatus) -> Result<(), sqlx::Error> {
        if let Some(entity) = self.entities.lock().unwrap().get_mut(&owner) {
            entity.status = status.to_string();
        }
        Ok(())
    }

    async fn add_warnings(&self, owner: OwnerRef, warnings: &[String]) -> Result<(), sqlx::Error> {
        if let Some(entity) = self.entities.lock().unwrap().get_mut(&owner) {
            entity.warnings.extend_from_slice(warnings);
        }
        Ok(())
    }
}

/// Asset table with a switch to make inserts fail.
#[derive(Default)]
pub struct MemoryAssetStore {
    assets: Mutex<Vec<Asset>>,
    fail_inserts: AtomicBool,
}

impl MemoryAssetStore {
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<Asset> {
        self.assets.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn insert_asset(&self, asset: &NewAsset) -> Result<Asset, sqlx::Error> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(sqlx::Error::Protocol("simulated insert failure".to_string()));
        }

        let mut assets = self.assets.lock().unwrap();
        if assets
            .iter()
            .any(|a| a.bucket == asset.bucket && a.object_path == asset.object_path)
        {
            return Err(sqlx::Error::Protocol("duplicate object path".to_string()));
        }

        let now = Utc::now();
        let row = Asset {
            id: Uuid::new_v4(),
            subject_id: asset.subject_id,
            photoshoot_id: asset.photoshoot_id,
            asset_type: asset.asset_type,
            bucket: asset.bucket.clone(),
            object_path: asset.object_path.clone(),
            original_filename: asset.original_filename.clone(),
            metadata: asset.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        assets.push(row.clone());
        Ok(row)
    }

    async fn get_assets(&self, ids: &[Uuid]) -> Result<Vec<Asset>, sqlx::Error> {
        let assets = self.assets.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| assets.iter().find(|a| a.id == *id).cloned())
            .collect())
    }
}

/// Object store keyed by (bucket, path).
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<(String, String), (Vec<u8>, String)>>,
    uploads: AtomicUsize,
    upload_attempts: AtomicUsize,
    failing_upload: Mutex<Option<usize>>,
}

impl MemoryStorage {
    /// Answer the `n`-th upload call (counting from 1) with a 503.
    pub fn fail_upload_number(&self, n: usize) {
        *self.failing_upload.lock().unwrap() = Some(n);
    }

    pub fn contains(&self, bucket: &str, path: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&(bucket.to_string(), path.to_string()))
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn content_type(&self, bucket: &str, path: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), path.to_string()))
            .map(|(_, content_type)| content_type.clone())
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let attempt = self.upload_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.failing_upload.lock().unwrap() == Some(attempt) {
            return Err(StorageError::Status {
                op: "upload",
                code: 503,
            });
        }

        let key = (bucket.to_string(), path.to_string());
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(StorageError::AlreadyExists {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }
        objects.insert(key, (data.to_vec(), content_type.to_string()));
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        Ok(format!(
            "https://storage.test/{bucket}/{path}?expires={}",
            ttl.as_secs()
        ))
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StorageError> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), path.to_string()));
        Ok(())
    }
}

type Script = Box<dyn Fn(usize) -> Result<ProviderOutput, ProviderError> + Send + Sync>;

/// Provider whose response is scripted per call number.
pub struct MockProvider {
    script: Script,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockProvider {
    pub fn new(
        script: impl Fn(usize) -> Result<ProviderOutput, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Same JSON body on every call.
    pub fn returning(body: Value) -> Self {
        Self::new(move |_| Ok(ProviderOutput::Json(body.clone())))
    }

    /// HTTP error status on every call.
    pub fn failing(code: u16) -> Self {
        Self::new(move |_| {
            Err(ProviderError::Status {
                code,
                body: "provider unavailable".to_string(),
            })
        })
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, model: &str, input: Value) -> Result<ProviderOutput, ProviderError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((model.to_string(), input));
            calls.len() - 1
        };
        (self.script)(call)
    }
}

/// Serves the same bytes for every URL except those marked missing.
pub struct MockFetcher {
    body: Vec<u8>,
    missing: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn serving(body: Vec<u8>) -> Self {
        Self {
            body,
            missing: Mutex::new(HashSet::new()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn mark_missing(&self, url: &str) {
        self.missing.lock().unwrap().insert(url.to_string());
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError> {
        self.fetched.lock().unwrap().push(url.to_string());
        if self.missing.lock().unwrap().contains(url) {
            return Err(FetchError::Status {
                url: url.to_string(),
                code: 404,
            });
        }
        Ok(FetchedImage {
            bytes: self.body.clone(),
            content_type: Some("image/png".to_string()),
        })
    }
}

pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        worker_id: "worker-test".to_string(),
        poll_interval: Duration::from_millis(10),
        thumbnail_size: 32,
        ..PipelineSettings::default()
    }
}

/// Every collaborator in memory, wired into an [`AppState`].
pub struct TestPipeline {
    pub jobs: Arc<MemoryJobStore>,
    pub entities: Arc<MemoryEntityStore>,
    pub assets: Arc<MemoryAssetStore>,
    pub storage: Arc<MemoryStorage>,
    pub provider: Arc<MockProvider>,
    pub fetcher: Arc<MockFetcher>,
    pub state: AppState,
}

impl TestPipeline {
    pub fn new(provider: MockProvider) -> Self {
        Self::with_fetcher(provider, MockFetcher::serving(crate::fixtures::png_bytes(64, 48)))
    }

    pub fn with_fetcher(provider: MockProvider, fetcher: MockFetcher) -> Self {
        let jobs = Arc::new(MemoryJobStore::default());
        let entities = Arc::new(MemoryEntityStore::default());
        let assets = Arc::new(MemoryAssetStore::default());
        let storage = Arc::new(MemoryStorage::default());
        let provider = Arc::new(provider);
        let fetcher = Arc::new(fetcher);

        let state = AppState::new(
            jobs.clone(),
            entities.clone(),
            assets.clone(),
            storage.clone(),
            provider.clone(),
            fetcher.clone(),
            test_settings(),
        );

        Self {
            jobs,
            entities,
            assets,
            storage,
            provider,
            fetcher,
            state,
        }
    }

    pub async fn enqueue(&self, job: NewJob) -> Job {
        self.jobs.enqueue(&job).await.expect("enqueue")
    }
}
