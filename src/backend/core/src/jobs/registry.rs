//! Process-wide set of named queues, constructed once and shared by `Arc`.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::queue::{JobQueue, QueueConfig};

/// Hands out one [`JobQueue`] per name.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    defaults: QueueConfig,
    overrides: HashMap<String, QueueConfig>,
    queues: DashMap<String, Arc<JobQueue>>,
}

impl QueueRegistry {
    pub fn new(defaults: QueueConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            queues: DashMap::new(),
        }
    }

    /// Use `config` instead of the defaults for the queue named `name`.
    pub fn with_queue_config(mut self, name: impl Into<String>, config: QueueConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    pub fn config_for(&self, name: &str) -> QueueConfig {
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// The queue named `name`, created on first use.
    pub fn get_queue(&self, name: &str) -> Arc<JobQueue> {
        if let Some(queue) = self.queues.get(name) {
            return queue.clone();
        }
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self.config_for(name);
                debug!(queue = %name, max_pending_jobs = config.max_pending_jobs, "Creating queue");
                Arc::new(JobQueue::new(name, config))
            })
            .clone()
    }

    /// Register a queue built elsewhere, e.g. over a custom backend.
    /// An existing queue with the same name is kept and returned.
    pub fn register(&self, queue: JobQueue) -> Arc<JobQueue> {
        self.queues
            .entry(queue.name().to_string())
            .or_insert_with(|| Arc::new(queue))
            .clone()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn close_all(&self) {
        for queue in self.queues.iter() {
            queue.close();
        }
        info!(queues = self.queues.len(), "All queues closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_singleton_per_name() {
        let registry = QueueRegistry::default();
        let a = registry.get_queue("hr-leave-accrual");
        let b = registry.get_queue("hr-leave-accrual");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &registry.get_queue("hr-notifications")));
        assert_eq!(registry.queue_names(), vec!["hr-leave-accrual", "hr-notifications"]);
    }

    #[test]
    fn test_overrides_apply() {
        let registry = QueueRegistry::new(QueueConfig::default())
            .with_queue_config("hr-leave-accrual", QueueConfig::default().with_max_pending_jobs(100));

        assert_eq!(registry.get_queue("hr-leave-accrual").config().max_pending_jobs, 100);
        assert_eq!(registry.get_queue("other").config().max_pending_jobs, 1000);
    }

    #[test]
    fn test_register_keeps_existing() {
        let registry = QueueRegistry::default();
        let first = registry.get_queue("q");
        let second = registry.register(JobQueue::new("q", QueueConfig::default()));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_close_all() {
        let registry = QueueRegistry::default();
        let queue = registry.get_queue("q");
        registry.close_all();
        assert!(queue.is_closed());
    }
}
