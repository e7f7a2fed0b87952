//! Static executor registries, built once at startup.

use crate::executor::{TaskCheckExecutor, TaskExecutor};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use strata_core::check::TaskCheckType;
use strata_core::task::TaskType;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("An executor is already registered for {0}")]
    Duplicate(String),
}

/// Maps a type key to exactly one executor.
pub struct Registry<K, E: ?Sized> {
    entries: HashMap<K, Arc<E>>,
}

pub type TaskExecutorRegistry = Registry<TaskType, dyn TaskExecutor>;
pub type CheckExecutorRegistry = Registry<TaskCheckType, dyn TaskCheckExecutor>;

impl<K, E: ?Sized> Default for Registry<K, E> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, E> Registry<K, E>
where
    K: Copy + Eq + Hash + Display,
    E: ?Sized,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a key twice is a startup error.
    pub fn register(&mut self, key: K, executor: Arc<E>) -> Result<(), RegistryError> {
        if self.entries.contains_key(&key) {
            return Err(RegistryError::Duplicate(key.to_string()));
        }
        debug!(key = %key, "Registered executor");
        self.entries.insert(key, executor);
        Ok(())
    }

    /// Builder form of [`Registry::register`].
    pub fn with(mut self, key: K, executor: Arc<E>) -> Result<Self, RegistryError> {
        self.register(key, executor)?;
        Ok(self)
    }

    pub fn get(&self, key: &K) -> Option<Arc<E>> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn executors(&self) -> impl Iterator<Item = &Arc<E>> {
        self.entries.values()
    }

    /// Keys from `expected` that have no executor.
    pub fn missing(&self, expected: &[K]) -> Vec<K> {
        expected
            .iter()
            .filter(|k| !self.entries.contains_key(k))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionContext, ExecutorError, RunOnce};
    use async_trait::async_trait;
    use strata_core::task::{Task, TaskRunResult};

    struct Noop;

    #[async_trait]
    impl TaskExecutor for Noop {
        async fn run_once(
            &self,
            _ctx: &ExecutionContext,
            _task: &Task,
        ) -> Result<RunOnce, ExecutorError> {
            Ok(RunOnce::Completed(TaskRunResult::detail("noop")))
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = TaskExecutorRegistry::new();
        registry.register(TaskType::General, Arc::new(Noop)).unwrap();

        let err = registry
            .register(TaskType::General, Arc::new(Noop))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(ref key) if key == "general"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_and_missing() {
        let registry = TaskExecutorRegistry::new()
            .with(TaskType::General, Arc::new(Noop))
            .unwrap()
            .with(TaskType::DatabaseBackup, Arc::new(Noop))
            .unwrap();

        assert!(registry.get(&TaskType::General).is_some());
        assert!(registry.get(&TaskType::PitrCutover).is_none());
        assert_eq!(
            registry.missing(&[TaskType::General, TaskType::PitrCutover]),
            vec![TaskType::PitrCutover]
        );
    }
}
