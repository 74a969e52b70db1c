use std::sync::Arc;

use crate::config::PipelineSettings;
use crate::db::store::{AssetStore, EntityStore, JobStore};
use crate::services::{
    asset_writer::AssetWriter, fetch::ImageFetcher, provider::ImageProvider,
    storage::ObjectStorage,
};

/// Explicitly constructed collaborators shared by the poll loop and handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub entities: Arc<dyn EntityStore>,
    pub assets: Arc<dyn AssetStore>,
    pub storage: Arc<dyn ObjectStorage>,
    pub provider: Arc<dyn ImageProvider>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub writer: Arc<AssetWriter>,
    pub settings: Arc<PipelineSettings>,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        entities: Arc<dyn EntityStore>,
        assets: Arc<dyn AssetStore>,
        storage: Arc<dyn ObjectStorage>,
        provider: Arc<dyn ImageProvider>,
        fetcher: Arc<dyn ImageFetcher>,
        settings: PipelineSettings,
    ) -> Self {
        let writer = AssetWriter::new(
            storage.clone(),
            assets.clone(),
            fetcher.clone(),
            settings.assets_bucket.clone(),
        );

        Self {
            jobs,
            entities,
            assets,
            storage,
            provider,
            fetcher,
            writer: Arc::new(writer),
            settings: Arc::new(settings),
        }
    }
}
