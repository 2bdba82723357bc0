//! Process wiring: store selection, repository, and background workers.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use jobrun_core::{JobRef, Run, RunError, RunId};
use jobrun_infra::runs::{
    InMemoryRunStore, PostgresRunStore, RunEventPublisher, RunRepository, RunStore, RunTx,
    TracingRunEventSink,
};
use jobrun_infra::workers::{HandlerRegistry, Reaper, RunExecutor, WorkerHandle};

use crate::config::SchedulerConfig;

/// The store backing a scheduler process.
#[derive(Debug, Clone)]
pub enum SchedulerStore {
    InMemory(Arc<InMemoryRunStore>),
    Postgres(Arc<PostgresRunStore>),
}

impl SchedulerStore {
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerStore::InMemory(_) => "in_memory",
            SchedulerStore::Postgres(_) => "postgres",
        }
    }

    pub fn upsert_job(&self, job: &JobRef) -> Result<(), RunError> {
        match self {
            SchedulerStore::InMemory(store) => {
                store.upsert_job(job.clone());
                Ok(())
            }
            SchedulerStore::Postgres(store) => store.upsert_job(job),
        }
    }
}

impl RunStore for SchedulerStore {
    fn transact<T, F>(&self, work: F) -> Result<T, RunError>
    where
        F: FnOnce(&mut dyn RunTx) -> Result<T, RunError>,
    {
        match self {
            SchedulerStore::InMemory(store) => store.transact(work),
            SchedulerStore::Postgres(store) => store.transact(work),
        }
    }

    fn lookup_run(&self, run_id: RunId) -> Result<Option<Run>, RunError> {
        match self {
            SchedulerStore::InMemory(store) => store.lookup_run(run_id),
            SchedulerStore::Postgres(store) => store.lookup_run(run_id),
        }
    }
}

/// A configured scheduler process.
///
/// Postgres calls block on the runtime behind `handle`, so `App` must be
/// built and driven from threads that are not themselves runtime workers.
#[derive(Debug)]
pub struct App {
    config: SchedulerConfig,
    store: SchedulerStore,
    repo: RunRepository<SchedulerStore>,
}

impl App {
    /// Postgres when `DATABASE_URL` is set (schema is bootstrapped),
    /// otherwise an in-memory store.
    pub fn build(config: SchedulerConfig, handle: &Handle) -> Result<Self, RunError> {
        let store = match config.database_url.as_deref() {
            Some(url) => {
                let store =
                    PostgresRunStore::connect(url, config.db_max_connections, handle.clone())?;
                store.migrate()?;
                SchedulerStore::Postgres(Arc::new(store))
            }
            None => SchedulerStore::InMemory(InMemoryRunStore::arc()),
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: SchedulerConfig, store: SchedulerStore) -> Self {
        let events = RunEventPublisher::new(Arc::new(TracingRunEventSink))
            .with_send(config.retryable_send());
        let repo = RunRepository::new(store.clone())
            .with_retry(config.retryable_transaction())
            .with_events(events);

        info!(
            server_id = %config.server_id,
            store = store.kind(),
            "scheduler configured"
        );
        Self {
            config,
            store,
            repo,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &SchedulerStore {
        &self.store
    }

    pub fn repository(&self) -> &RunRepository<SchedulerStore> {
        &self.repo
    }

    pub fn spawn_reaper(&self) -> std::io::Result<WorkerHandle> {
        Reaper::new(self.repo.clone(), self.config.reaper_config()).spawn()
    }

    /// Start an executor claiming runs as this process's server id and
    /// dispatching them to `registry`.
    pub fn spawn_worker(&self, registry: HandlerRegistry) -> std::io::Result<WorkerHandle> {
        RunExecutor::new(
            self.repo.clone(),
            Arc::new(registry),
            self.config.executor_config(),
        )
        .spawn()
    }
}
