//! Repository traits the pipeline depends on, plus their Postgres adapter.
//!
//! Handlers, the retry controller and the poll loop only see these traits, so
//! they can run against in-memory implementations in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{asset_queries, entity_queries, queries};
use crate::models::asset::{Asset, NewAsset};
use crate::models::entity::{EntityStatus, OwnerKind, OwnerRef, OwningEntity};
use crate::models::job::{Job, NewJob};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: &NewJob) -> Result<Job, sqlx::Error>;

    /// Atomically move the oldest eligible queued job to `running` for this
    /// worker. Two concurrent callers never receive the same job.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, sqlx::Error>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, sqlx::Error>;

    async fn mark_done(&self, job_id: Uuid, result: &serde_json::Value)
        -> Result<bool, sqlx::Error>;

    /// Count a failed attempt and, in the same write, requeue the job until
    /// `requeue_at` or fail it when that is `None`. Only applies while the
    /// job is active and still has `seen_attempts` attempts.
    async fn record_failure(
        &self,
        job_id: Uuid,
        seen_attempts: i32,
        requeue_at: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<bool, sqlx::Error>;

    /// Queued jobs eligible for claiming right now.
    async fn queue_depth(&self) -> Result<i64, sqlx::Error>;

    async fn health_check(&self) -> Result<(), sqlx::Error>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity(&self, owner: OwnerRef) -> Result<Option<OwningEntity>, sqlx::Error>;

    async fn append_assets(
        &self,
        owner: OwnerRef,
        asset_ids: &[Uuid],
        status: EntityStatus,
    ) -> Result<(), sqlx::Error>;

    async fn set_status(&self, owner: OwnerRef, status: EntityStatus) -> Result<(), sqlx::Error>;

    async fn add_warnings(&self, owner: OwnerRef, warnings: &[String]) -> Result<(), sqlx::Error>;
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Insert the asset row (and its photoshoot join row, if any).
    async fn insert_asset(&self, asset: &NewAsset) -> Result<Asset, sqlx::Error>;

    async fn get_assets(&self, ids: &[Uuid]) -> Result<Vec<Asset>, sqlx::Error>;
}

/// Postgres implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn enqueue(&self, job: &NewJob) -> Result<Job, sqlx::Error> {
        queries::enqueue_job(&self.pool, job).await
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, sqlx::Error> {
        queries::claim_next(&self.pool, worker_id).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
        queries::get_job(&self.pool, job_id).await
    }

    async fn mark_done(
        &self,
        job_id: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        queries::mark_done(&self.pool, job_id, result).await
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        seen_attempts: i32,
        requeue_at: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        queries::record_failure(&self.pool, job_id, seen_attempts, requeue_at, error).await
    }

    async fn queue_depth(&self) -> Result<i64, sqlx::Error> {
        queries::queue_depth(&self.pool).await
    }

    async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn get_entity(&self, owner: OwnerRef) -> Result<Option<OwningEntity>, sqlx::Error> {
        match owner.kind {
            OwnerKind::Subject => entity_queries::get_subject(&self.pool, owner.id).await,
            OwnerKind::Photoshoot => entity_queries::get_photoshoot(&self.pool, owner.id).await,
        }
    }

    async fn append_assets(
        &self,
        owner: OwnerRef,
        asset_ids: &[Uuid],
        status: EntityStatus,
    ) -> Result<(), sqlx::Error> {
        entity_queries::append_assets(&self.pool, owner, asset_ids, status).await
    }

    async fn set_status(&self, owner: OwnerRef, status: EntityStatus) -> Result<(), sqlx::Error> {
        entity_queries::set_status(&self.pool, owner, status).await
    }

    async fn add_warnings(&self, owner: OwnerRef, warnings: &[String]) -> Result<(), sqlx::Error> {
        entity_queries::add_warnings(&self.pool, owner, warnings).await
    }
}

#[async_trait]
impl AssetStore for PgStore {
    async fn insert_asset(&self, asset: &NewAsset) -> Result<Asset, sqlx::Error> {
        asset_queries::insert_asset(&self.pool, asset).await
    }

    async fn get_assets(&self, ids: &[Uuid]) -> Result<Vec<Asset>, sqlx::Error> {
        asset_queries::get_assets(&self.pool, ids).await
    }
}
