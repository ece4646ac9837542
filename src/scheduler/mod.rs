//! Scheduler module for polling PLC tags.
//!
//! One task per active tag. Tasks for the same endpoint share a pooled link
//! and take turns on it; a tag's own loop is sequential, so ticks missed
//! while a read is pending are skipped rather than queued.

mod backoff;
mod connections;
mod health;
mod registry;

pub use backoff::*;
pub use connections::*;
pub use health::*;
pub use registry::*;

use crate::ads::{AdsConnector, Endpoint};
use crate::alerting::{classify, spawn_writer, TagState, WriteJob, WriterHandle};
use crate::config::PollerConfig;
use crate::db::{DbError, PlcTag, TagPersistence};

use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Shortest poll interval a tag may ask for.
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Upper bound of the random start offset added to staggered tags.
const START_JITTER_MS: u64 = 50;

struct PollTask {
    tag: Arc<PlcTag>,
    stop_tx: broadcast::Sender<()>,
}

/// Everything a poll task needs besides its tag.
#[derive(Clone)]
struct PollContext {
    pool: Arc<ConnectionPool>,
    health: Arc<HealthBoard>,
    writer: WriterHandle,
    epsilon: f64,
    ceiling_factor: u32,
}

/// The main scheduler that orchestrates tag polling.
#[derive(Clone)]
pub struct Scheduler {
    config: PollerConfig,
    registry: Arc<TagRegistry>,
    ctx: PollContext,
    tasks: Arc<RwLock<HashMap<i64, PollTask>>>,
    writer_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    /// Create a new scheduler. Starts the writer task right away.
    pub fn new(store: Arc<dyn TagPersistence>, connector: Arc<dyn AdsConnector>, config: PollerConfig) -> Self {
        let (writer, writer_task) = spawn_writer(store.clone(), &config);
        let pool = Arc::new(ConnectionPool::new(
            connector,
            config.connect_timeout,
            config.read_timeout,
        ));
        let health = Arc::new(HealthBoard::new(HealthPolicy {
            offline_after: config.offline_after,
            warning_after: config.warning_after,
            slow_read: config.slow_read,
        }));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            registry: Arc::new(TagRegistry::new(store)),
            ctx: PollContext {
                pool,
                health,
                writer,
                epsilon: config.real_epsilon,
                ceiling_factor: config.backoff_ceiling_factor,
            },
            config,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            writer_task: Arc::new(StdMutex::new(Some(writer_task))),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> Arc<TagRegistry> {
        self.registry.clone()
    }

    pub fn health(&self) -> Arc<HealthBoard> {
        self.ctx.health.clone()
    }

    /// Load the registry, start polling and the background loops.
    pub async fn start(&self) -> Result<(), DbError> {
        let snapshot = self.registry.reload()?;
        tracing::info!(
            "Starting scheduler with {} tags on {} sites",
            snapshot.tag_count(),
            snapshot.active_tags_by_site().len()
        );
        self.sync(&snapshot).await;

        let this = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move { this.run_refresh_loop(shutdown_rx).await });

        let pool = self.ctx.pool.clone();
        let idle = self.config.idle_close;
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(run_idle_reaper(pool, idle, shutdown_rx));

        Ok(())
    }

    /// Reload the registry and reconcile running tasks with it.
    pub async fn refresh(&self) -> Result<(), DbError> {
        let snapshot = self.registry.reload()?;
        self.sync(&snapshot).await;
        Ok(())
    }

    /// Make the running tasks match `snapshot`.
    ///
    /// Tasks for tags that are gone, inactive or redefined are stopped; new
    /// and redefined tags are started staggered across their endpoint.
    pub async fn sync(&self, snapshot: &Snapshot) {
        let wanted: HashMap<i64, &PlcTag> = snapshot.tags().map(|t| (t.id, t)).collect();
        let mut tasks = self.tasks.write().await;

        tasks.retain(|id, task| {
            let keep = wanted
                .get(id)
                .map(|t| task.tag.same_definition(t))
                .unwrap_or(false);
            if !keep {
                let _ = task.stop_tx.send(());
                tracing::info!("Scheduler: Stopped tag {}", task.tag.tag_name);
            }
            keep
        });

        let mut by_endpoint: HashMap<&Endpoint, Vec<&PlcTag>> = HashMap::new();
        for tag in snapshot.tags() {
            if let Some(endpoint) = snapshot.connection_for(tag) {
                by_endpoint.entry(endpoint).or_default().push(tag);
            }
        }

        for (_, mut group) in by_endpoint {
            group.sort_by_key(|t| t.id);
            let n = group.len();
            for (k, tag) in group.into_iter().enumerate() {
                if tasks.contains_key(&tag.id) {
                    continue;
                }
                let Some(site) = snapshot.site(tag.site_id) else {
                    continue;
                };
                let delay = stagger(poll_interval(tag), k, n);
                let state = TagState::new(tag).with_open_alert(snapshot.has_open_alert(tag.id));
                let task = self.spawn_poll_task(Arc::new(tag.clone()), site.clone(), state, delay);
                tasks.insert(tag.id, task);
            }
        }

        let sites: HashSet<i64> = snapshot.active_tags_by_site().keys().copied().collect();
        self.ctx.health.retain(&sites);
    }

    fn spawn_poll_task(
        &self,
        tag: Arc<PlcTag>,
        site: SiteTarget,
        state: TagState,
        start_delay: Duration,
    ) -> PollTask {
        let (stop_tx, _) = broadcast::channel(1);
        tracing::info!(
            "Scheduler: Adding tag {} on {} every {:?}",
            tag.tag_name,
            site.endpoint,
            poll_interval(&tag)
        );

        let ctx = self.ctx.clone();
        let stop_rx = stop_tx.subscribe();
        tokio::spawn(run_poll_loop(ctx, tag.clone(), site, state, start_delay, stop_rx));

        PollTask { tag, stop_tx }
    }

    /// Stop polling a tag.
    pub async fn remove_tag(&self, id: i64) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.remove(&id) {
            let _ = task.stop_tx.send(());
            tracing::info!("Scheduler: Removed tag {}", id);
        }
    }

    /// IDs of tags with a running poll task.
    pub async fn running_tags(&self) -> Vec<i64> {
        let tasks = self.tasks.read().await;
        let mut ids: Vec<i64> = tasks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every task, close links and flush pending writes.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        {
            let mut tasks = self.tasks.write().await;
            for (_, task) in tasks.drain() {
                let _ = task.stop_tx.send(());
            }
        }
        self.ctx.pool.close_all().await;
        self.ctx.writer.close();

        let writer_task = self
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = writer_task {
            if let Err(e) = task.await {
                tracing::error!("Writer task failed: {}", e);
            }
        }
        tracing::info!("Scheduler stopped");
    }

    async fn run_refresh_loop(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.registry_refresh);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately and start() has just loaded.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
                _ = self.registry.refresh_requested() => {
                    tracing::debug!("Tag registry refresh requested");
                }
            }
            if let Err(e) = self.refresh().await {
                tracing::error!("Failed to reload tag registry: {}", e);
            }
        }
    }
}

fn poll_interval(tag: &PlcTag) -> Duration {
    Duration::from_millis(tag.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
}

/// Start offset of the k-th of n tags sharing an endpoint.
fn stagger(interval: Duration, k: usize, n: usize) -> Duration {
    let n = u32::try_from(n.max(1)).unwrap_or(u32::MAX);
    let k = u32::try_from(k).unwrap_or(u32::MAX).min(n - 1);
    let jitter = rand::thread_rng().gen_range(0..=START_JITTER_MS);
    interval.saturating_mul(k) / n + Duration::from_millis(jitter)
}

/// Run the poll loop for a single tag.
async fn run_poll_loop(
    ctx: PollContext,
    tag: Arc<PlcTag>,
    site: SiteTarget,
    mut state: TagState,
    start_delay: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = stop_rx.recv() => return,
        _ = tokio::time::sleep(start_delay) => {}
    }

    let mut backoff = Backoff::new(poll_interval(&tag), ctx.ceiling_factor);

    loop {
        let started = Instant::now();
        let result = ctx
            .pool
            .read(&site.endpoint, &tag.plc_address, tag.data_type)
            .await;

        // Stopped mid-read: the result belongs to a definition that is gone.
        if !matches!(stop_rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
            break;
        }

        let at = Utc::now();
        let elapsed = result.as_ref().map(|r| r.elapsed).unwrap_or_default();
        if let Some(outcome) = ReadOutcome::from_poll(&result, elapsed) {
            ctx.writer
                .site_update(ctx.health.record(tag.site_id, &site.name, &outcome, at));
        }

        let delay = match &result {
            Ok(_) => backoff.on_success(),
            Err(e) => {
                let delay = backoff.on_failure();
                tracing::debug!(
                    "Poll of {} failed ({}), attempt {}, next in {:?}",
                    tag.tag_name,
                    e.kind(),
                    backoff.failures(),
                    delay
                );
                delay
            }
        };

        let transition = classify(&tag, &mut state, result.map(|r| r.value), ctx.epsilon);
        ctx.writer.submit(WriteJob {
            tag: tag.clone(),
            transition,
            at,
        });

        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep_until(started + delay) => {}
        }
    }
    tracing::debug!("Poll loop for {} exited", tag.tag_name);
}

/// Periodically close links nobody has used for `idle`.
async fn run_idle_reaper(pool: Arc<ConnectionPool>, idle: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
    let period = (idle / 4).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let closed = pool.close_idle(idle).await;
                if closed > 0 {
                    tracing::debug!("Closed {} idle PLC links", closed);
                }
            }
        }
    }
}
