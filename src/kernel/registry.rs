use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::environment::EnvironmentManager;
use crate::sandbox::{EngineConfig, EngineError, KernelEngine};

/// Process-wide map of session id → execution engine.
pub struct KernelRegistry {
    engines: Mutex<HashMap<String, Arc<KernelEngine>>>,
    environments: Arc<EnvironmentManager>,
    config: EngineConfig,
}

impl KernelRegistry {
    pub fn new(environments: Arc<EnvironmentManager>, config: EngineConfig) -> Self {
        Self {
            engines: Mutex::new(HashMap::new()),
            environments,
            config,
        }
    }

    /// The session's engine, started on first use.
    pub fn get_or_create(&self, session_id: &str) -> Result<Arc<KernelEngine>, EngineError> {
        let mut engines = self
            .engines
            .lock()
            .map_err(|_| EngineError::Unavailable(session_id.to_string()))?;
        if let Some(engine) = engines.get(session_id) {
            return Ok(engine.clone());
        }
        let engine = Arc::new(KernelEngine::spawn(
            session_id,
            self.environments.clone(),
            self.config.clone(),
        )?);
        engines.insert(session_id.to_string(), engine.clone());
        Ok(engine)
    }

    /// Drops the registry's handle; the engine stops once in-flight callers let go.
    pub fn evict(&self, session_id: &str) -> bool {
        let removed = self
            .engines
            .lock()
            .ok()
            .and_then(|mut engines| engines.remove(session_id))
            .is_some();
        if removed {
            info!("Evicted execution engine for session {session_id}");
        }
        removed
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.engines
            .lock()
            .map(|engines| engines.contains_key(session_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.engines.lock().map(|engines| engines.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::tests::FakeInstaller;

    #[tokio::test]
    async fn test_get_or_create_reuses_and_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let envs = Arc::new(
            EnvironmentManager::new(dir.path(), Arc::new(FakeInstaller::default())).unwrap(),
        );
        let registry = KernelRegistry::new(envs, EngineConfig::default());

        let a = registry.get_or_create("s1").unwrap();
        let again = registry.get_or_create("s1").unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        registry.get_or_create("s2").unwrap();
        assert_eq!(registry.len(), 2);

        assert!(registry.evict("s1"));
        assert!(!registry.evict("s1"));
        assert!(!registry.contains("s1"));
        let fresh = registry.get_or_create("s1").unwrap();
        assert!(!Arc::ptr_eq(&a, &fresh));
    }
}
