//! Keyed registry of coordinators - one per job.
//!
//! Parallelism across jobs comes from instantiating one coordinator per
//! key; within a key the coordinator keeps executions single-flight. The
//! registry owns that per-key construction and tears every coordinator
//! down on shutdown.

use std::sync::Arc;

use dashmap::DashMap;

use crate::coordinator::{Coordinator, WaitError};
use crate::executor::TaskSpawner;
use crate::handler::RecomputeHandler;

type HandlerFactory = Box<dyn Fn(&str) -> Arc<dyn RecomputeHandler> + Send + Sync>;

pub struct CoordinatorRegistry {
    coordinators: DashMap<String, Arc<Coordinator>>,
    factory: HandlerFactory,
    spawner: Arc<dyn TaskSpawner>,
}

impl CoordinatorRegistry {
    /// `factory` builds the recompute handler for a job the first time its
    /// coordinator is requested.
    pub fn new(
        spawner: Arc<dyn TaskSpawner>,
        factory: impl Fn(&str) -> Arc<dyn RecomputeHandler> + Send + Sync + 'static,
    ) -> Self {
        Self {
            coordinators: DashMap::new(),
            factory: Box::new(factory),
            spawner,
        }
    }

    /// Get the coordinator for a job, creating it on first use.
    pub fn coordinator(&self, job_id: &str) -> Arc<Coordinator> {
        self.coordinators
            .entry(job_id.to_string())
            .or_insert_with(|| {
                Coordinator::new(job_id, (self.factory)(job_id), Arc::clone(&self.spawner))
            })
            .clone()
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<Coordinator>> {
        self.coordinators.get(job_id).map(|entry| Arc::clone(&entry))
    }

    /// Drop a job's coordinator. Callers holding an `Arc` keep theirs alive;
    /// the next `coordinator` call builds a fresh one.
    pub fn remove(&self, job_id: &str) -> Option<Arc<Coordinator>> {
        self.coordinators
            .remove(job_id)
            .map(|(_, coordinator)| coordinator)
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }

    /// Shut down every registered coordinator, draining each before
    /// returning. All coordinators are drained even when one fails; the
    /// first failure is returned.
    pub async fn shutdown_all(&self) -> Result<(), WaitError> {
        let all: Vec<_> = self
            .coordinators
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut first_error = None;
        for coordinator in all {
            if let Err(error) = coordinator.shutdown().await {
                tracing::error!(
                    job = %coordinator.job_id(),
                    error = %error,
                    "Coordinator failed to drain during shutdown"
                );
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RuntimeSpawner;
    use crate::handler::ApplyError;
    use crate::snapshot::Snapshot;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        applies: AtomicUsize,
        shut_down: AtomicBool,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                applies: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl RecomputeHandler for CountingHandler {
        async fn apply(&self, _: &Snapshot, _: Duration) -> Result<(), ApplyError> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn recompute_window(&self) -> Duration {
            Duration::from_secs(600)
        }

        fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    fn registry() -> (CoordinatorRegistry, Arc<CountingHandler>) {
        let handler = CountingHandler::new();
        let registry = CoordinatorRegistry::new(Arc::new(RuntimeSpawner::current()), {
            let handler = Arc::clone(&handler);
            move |_| Arc::clone(&handler) as Arc<dyn RecomputeHandler>
        });
        (registry, handler)
    }

    fn snapshot() -> Snapshot {
        Snapshot::new(
            serde_json::json!({}),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn coordinator_is_created_once_per_job() {
        let (registry, _) = registry();

        let first = registry.coordinator("job-a");
        let again = registry.coordinator("job-a");
        let other = registry.coordinator("job-b");

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn removed_job_gets_a_fresh_coordinator() {
        let (registry, _) = registry();

        let first = registry.coordinator("job-a");
        assert!(registry.remove("job-a").is_some());
        assert!(registry.get("job-a").is_none());

        let second = registry.coordinator("job-a");
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn shutdown_all_drains_every_coordinator() {
        let (registry, handler) = registry();

        registry.coordinator("job-a").submit(snapshot());
        registry.coordinator("job-b").submit(snapshot());

        registry.shutdown_all().await.unwrap();

        assert!(handler.shut_down.load(Ordering::SeqCst));
        registry.coordinator("job-a").wait_until_idle().await.unwrap();
        registry.coordinator("job-b").wait_until_idle().await.unwrap();
    }
}
