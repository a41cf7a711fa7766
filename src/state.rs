use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;

use crate::{
    config::{AppConfig, SyncConfig},
    db,
    error::SYNC_NOT_CONFIGURED,
    live::ChangeBus,
    migrate,
    mutators::Mutator,
    sync::{
        self, HttpRemote, RemoteEndpoint, SyncCoordinator, SyncOutcome, SyncProgress,
        SyncStateHandle, SyncTrigger,
    },
    AppError, AppResult,
};

/// Process-wide handles, wired once at startup and cloned into callers.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub bus: ChangeBus,
    pub mutator: Mutator,
    pub sync_state: SyncStateHandle,
    pub trigger: Option<SyncTrigger>,
    pub db_path: Option<Arc<PathBuf>>,
}

impl AppState {
    /// Open the on-disk store and, when a remote URL is configured, the
    /// HTTP sync client.
    pub async fn open(config: &AppConfig) -> AppResult<Self> {
        let db_path = config.db_path();
        let pool = db::open_sqlite_pool(&db_path).await?;
        let remote: Option<Arc<dyn RemoteEndpoint>> = match config.sync.remote_url.as_deref() {
            Some(url) => Some(Arc::new(HttpRemote::new(url)?)),
            None => None,
        };
        let mut state = Self::from_pool(pool, &config.sync, remote).await?;
        state.db_path = Some(Arc::new(db_path));
        Ok(state)
    }

    /// Wire everything around an existing pool. Migrations run here so the
    /// mutators never see an old schema.
    pub async fn from_pool(
        pool: SqlitePool,
        sync_config: &SyncConfig,
        remote: Option<Arc<dyn RemoteEndpoint>>,
    ) -> AppResult<Self> {
        migrate::apply_migrations(&pool).await?;

        let bus = ChangeBus::new(pool.clone());
        let sync_state = SyncStateHandle::default();
        sync_state.refresh_pending(&pool).await;
        let last_sync_at = sync::last_sync_at(&pool).await?;
        sync_state.update(|s| s.last_sync_at = last_sync_at);

        let mutator = Mutator::new(pool.clone(), bus.clone()).with_state(sync_state.clone());
        let trigger = remote.map(|remote| {
            let coordinator =
                SyncCoordinator::new(pool.clone(), bus.clone(), remote, sync_config.clone())
                    .with_state(sync_state.clone());
            SyncTrigger::new(Arc::new(coordinator))
        });

        Ok(Self {
            pool,
            bus,
            mutator,
            sync_state,
            trigger,
            db_path: None,
        })
    }

    pub fn trigger(&self) -> AppResult<&SyncTrigger> {
        self.trigger
            .as_ref()
            .ok_or_else(|| AppError::new(SYNC_NOT_CONFIGURED, "No sync server is configured"))
    }

    /// Run a sync now, bypassing the trigger delay.
    pub async fn perform_sync<P>(&self, force: bool, on_progress: P) -> SyncOutcome
    where
        P: Fn(SyncProgress) + Send + Sync,
    {
        match self.trigger() {
            Ok(trigger) => trigger.coordinator().perform_sync(force, on_progress).await,
            Err(err) => SyncOutcome {
                error: Some(err),
                ..SyncOutcome::default()
            },
        }
    }

    /// Start the keep-fresh timer; `None` without a remote or with a zero period.
    pub fn spawn_keep_fresh(&self, period: Duration) -> Option<JoinHandle<()>> {
        if period.is_zero() {
            return None;
        }
        self.trigger
            .as_ref()
            .map(|trigger| trigger.spawn_interval(period))
    }
}
