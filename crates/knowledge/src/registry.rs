//! Backend adapter factory.
//!
//! Maps a [`BackendType`] to a constructor. The manager asks the registry
//! for each supported type at startup; tests register in-memory engines.

use crate::backend::{BackendAdapter, ChromaBackend, MilvusBackend};
use crate::engine::{ChromaEngine, MilvusEngine};
use crate::types::BackendType;
use knowbase_core::{AppConfig, AppError, AppResult};
use std::collections::BTreeMap;
use std::sync::Arc;

type BackendFactory = Box<dyn Fn() -> AppResult<Arc<dyn BackendAdapter>> + Send + Sync>;

#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<BackendType, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the REST engines described by `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        let chroma = config.chroma.clone();
        let milvus = config.milvus.clone();

        Self::new()
            .register(BackendType::Chroma, move || {
                let engine = ChromaEngine::new(&chroma.url, chroma.timeout_secs)?;
                Ok(Arc::new(ChromaBackend::new(Arc::new(engine))) as Arc<dyn BackendAdapter>)
            })
            .register(BackendType::Milvus, move || {
                let engine = MilvusEngine::new(
                    &milvus.uri,
                    milvus.token.clone(),
                    &milvus.database,
                    milvus.timeout_secs,
                )?
                .with_metric_type(&milvus.metric_type);
                let backend =
                    MilvusBackend::new(Arc::new(engine)).with_metric_type(&milvus.metric_type);
                Ok(Arc::new(backend) as Arc<dyn BackendAdapter>)
            })
    }

    /// Add or replace the constructor for one backend type.
    pub fn register<F>(mut self, backend: BackendType, factory: F) -> Self
    where
        F: Fn() -> AppResult<Arc<dyn BackendAdapter>> + Send + Sync + 'static,
    {
        self.factories.insert(backend, Box::new(factory));
        self
    }

    pub fn supported(&self) -> Vec<BackendType> {
        self.factories.keys().copied().collect()
    }

    pub fn create(&self, backend: BackendType) -> AppResult<Arc<dyn BackendAdapter>> {
        let factory = self.factories.get(&backend).ok_or_else(|| {
            AppError::Config(format!("Backend '{}' is not registered", backend))
        })?;
        tracing::debug!("Creating {} backend adapter", backend);
        factory()
    }
}
