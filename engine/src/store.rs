//! Narrow read-only interface to the external pipeline-config store. The
//! single-pipeline binary serves everything from its JSON config file; the
//! trait exists so a control plane can plug a relational store in without
//! touching the operators.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::{PipelineConfig, TransformRule};
use crate::error::EngineError;
use crate::schema::{JoinMapping, SinkMapping};

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn sink_mappings(
        &self,
        pipeline: &str,
        source: &str,
        schema_version: &str,
    ) -> Result<SinkMapping, EngineError>;

    async fn join_rules(
        &self,
        pipeline: &str,
        left: &str,
        right: &str,
    ) -> Result<JoinMapping, EngineError>;

    async fn transform_rules(
        &self,
        pipeline: &str,
        source: &str,
        schema_version: &str,
    ) -> Result<Vec<TransformRule>, EngineError>;
}

/// Serves the JSON config file; the engine binary's only store.
pub struct StaticConfigStore {
    config: PipelineConfig,
}

impl StaticConfigStore {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn sink_mappings(
        &self,
        _pipeline: &str,
        _source: &str,
        _schema_version: &str,
    ) -> Result<SinkMapping, EngineError> {
        Ok(self.config.schema.sink.clone())
    }

    async fn join_rules(
        &self,
        _pipeline: &str,
        _left: &str,
        _right: &str,
    ) -> Result<JoinMapping, EngineError> {
        Ok(self.config.schema.join.clone())
    }

    async fn transform_rules(
        &self,
        _pipeline: &str,
        _source: &str,
        _schema_version: &str,
    ) -> Result<Vec<TransformRule>, EngineError> {
        Ok(self
            .config
            .transform
            .as_ref()
            .map(|t| t.rules.clone())
            .unwrap_or_default())
    }
}

/// Per-process cache over any store, keyed the way lookups arrive:
/// `(source, schema_version)` for sink and transform rules, `(left, right)`
/// for join rules.
pub struct CachingConfigStore {
    inner: Arc<dyn ConfigStore>,
    sink: RwLock<HashMap<(String, String), SinkMapping>>,
    join: RwLock<HashMap<(String, String), JoinMapping>>,
    transforms: RwLock<HashMap<(String, String), Vec<TransformRule>>>,
}

impl CachingConfigStore {
    pub fn new(inner: Arc<dyn ConfigStore>) -> Self {
        Self {
            inner,
            sink: RwLock::new(HashMap::new()),
            join: RwLock::new(HashMap::new()),
            transforms: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConfigStore for CachingConfigStore {
    async fn sink_mappings(
        &self,
        pipeline: &str,
        source: &str,
        schema_version: &str,
    ) -> Result<SinkMapping, EngineError> {
        let key = (source.to_string(), schema_version.to_string());
        if let Some(found) = self.sink.read().await.get(&key) {
            return Ok(found.clone());
        }
        let mappings = self
            .inner
            .sink_mappings(pipeline, source, schema_version)
            .await?;
        self.sink.write().await.insert(key, mappings.clone());
        Ok(mappings)
    }

    async fn join_rules(
        &self,
        pipeline: &str,
        left: &str,
        right: &str,
    ) -> Result<JoinMapping, EngineError> {
        let key = (left.to_string(), right.to_string());
        if let Some(found) = self.join.read().await.get(&key) {
            return Ok(found.clone());
        }
        let rules = self.inner.join_rules(pipeline, left, right).await?;
        self.join.write().await.insert(key, rules.clone());
        Ok(rules)
    }

    async fn transform_rules(
        &self,
        pipeline: &str,
        source: &str,
        schema_version: &str,
    ) -> Result<Vec<TransformRule>, EngineError> {
        let key = (source.to_string(), schema_version.to_string());
        if let Some(found) = self.transforms.read().await.get(&key) {
            return Ok(found.clone());
        }
        let rules = self
            .inner
            .transform_rules(pipeline, source, schema_version)
            .await?;
        self.transforms.write().await.insert(key, rules.clone());
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConfigStore for CountingStore {
        async fn sink_mappings(
            &self,
            _pipeline: &str,
            _source: &str,
            _schema_version: &str,
        ) -> Result<SinkMapping, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SinkMapping::default())
        }

        async fn join_rules(
            &self,
            _pipeline: &str,
            _left: &str,
            _right: &str,
        ) -> Result<JoinMapping, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(JoinMapping::default())
        }

        async fn transform_rules(
            &self,
            _pipeline: &str,
            _source: &str,
            _schema_version: &str,
        ) -> Result<Vec<TransformRule>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn cache_serves_repeat_lookups() {
        let inner = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
        });
        let store = CachingConfigStore::new(inner.clone());

        store.sink_mappings("p", "s", "v1").await.unwrap();
        store.sink_mappings("p", "s", "v1").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        // a different schema version is a different cache entry
        store.sink_mappings("p", "s", "v2").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        store.join_rules("p", "l", "r").await.unwrap();
        store.join_rules("p", "l", "r").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }
}
