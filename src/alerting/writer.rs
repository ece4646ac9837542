//! History and alert writer.
//!
//! Drains the write queue and applies each transition through
//! [`TagPersistence`]. Failed writes are retried a few times with a short
//! doubling delay, then logged and dropped. Every job is safe to replay.

use super::detector::{AlarmEdge, Transition};
use super::queue::{SiteEvent, SiteUpdate, WriteJob, WriteQueue};
use crate::config::PollerConfig;
use crate::db::{AlertType, DbError, NewAlert, PlcTag, PlcValue, Severity, SiteStatus, TagPersistence};

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Condition key used for a site's communication alert.
pub fn site_condition_key(site_id: i64) -> String {
    format!("site:{}:offline", site_id)
}

/// Applies queued writes to the store.
pub struct AlertWriter {
    store: Arc<dyn TagPersistence>,
    retries: u32,
}

impl AlertWriter {
    pub fn new(store: Arc<dyn TagPersistence>, retries: u32) -> Self {
        Self { store, retries }
    }

    /// Persist one transition. Returns whether it was written.
    pub async fn apply(&self, job: &WriteJob) -> bool {
        let what = format!("{} for tag {}", job.transition.name(), job.tag.tag_name);
        self.persist(&what, || self.write_job(job)).await
    }

    /// Persist a site check and act on its event.
    pub async fn apply_site(&self, update: &SiteUpdate) -> bool {
        let what = format!("site check for {}", update.site_name);
        self.persist(&what, || self.write_site(update)).await
    }

    async fn persist<F>(&self, what: &str, mut op: F) -> bool
    where
        F: FnMut() -> Result<(), DbError>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            match op() {
                Ok(()) => return true,
                Err(DbError::NotFound) => {
                    tracing::debug!("Skipping {}: row no longer exists", what);
                    return false;
                }
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!("Persisting {} failed (attempt {}): {}", what, attempt, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    tracing::error!("Dropping {} after {} retries: {}", what, self.retries, e);
                    return false;
                }
            }
        }
    }

    fn write_job(&self, job: &WriteJob) -> Result<(), DbError> {
        let tag = &job.tag;
        let Some((old, new)) = job.transition.values() else {
            // Unchanged and ConnectionFailed keep the value and only mark the read.
            return self.store.touch_tag(tag.id, job.at);
        };

        let old_text = old.map(PlcValue::to_text);
        let written = self
            .store
            .record_change(tag.id, old_text.as_deref(), &new.to_text(), job.at)?;
        if written {
            tracing::debug!(
                "{}: {} -> {} ({})",
                tag.tag_name,
                old_text.as_deref().unwrap_or("-"),
                new,
                job.transition.name()
            );
        }

        match job.transition.alarm_edge() {
            Some(AlarmEdge::Entered) => self.open_tag_alert(tag, new, job.at),
            Some(AlarmEdge::Cleared) => self.resolve_tag_alerts(tag, job.at),
            None => Ok(()),
        }
    }

    fn open_tag_alert(&self, tag: &PlcTag, value: &PlcValue, at: DateTime<Utc>) -> Result<(), DbError> {
        let key = tag.condition_key();
        if self.store.find_open_alert(Some(tag.id), &key)?.is_some() {
            return Ok(());
        }

        let alert_type = if tag.severity_level == Severity::Critical {
            AlertType::PlcTagTrip
        } else {
            AlertType::PlcTagAlarm
        };
        let label = if tag.description.is_empty() {
            tag.tag_name.as_str()
        } else {
            tag.description.as_str()
        };
        let id = self.store.insert_alert(&NewAlert {
            site_id: Some(tag.site_id),
            tag_id: Some(tag.id),
            condition_key: key,
            alert_type,
            severity: tag.severity_level,
            title: format!("{} alarm", tag.tag_name),
            message: format!("{} ({}) is {}", label, tag.plc_address, value),
            metadata: json!({
                "tagName": tag.tag_name,
                "plcAddress": tag.plc_address,
                "dataType": tag.data_type,
                "value": value.to_text(),
            }),
            created_at: at,
        })?;
        tracing::info!("Alert {} opened: {} is {}", id, tag.tag_name, value);
        Ok(())
    }

    /// Clear every open alert of the tag. Keys of alerts raised under an
    /// earlier name or polarity no longer match `condition_key()`.
    fn resolve_tag_alerts(&self, tag: &PlcTag, at: DateTime<Utc>) -> Result<(), DbError> {
        let n = self.store.resolve_tag_alerts(tag.id, at)?;
        if n > 0 {
            tracing::info!("Resolved {} alert(s) for {}", n, tag.tag_name);
        }
        Ok(())
    }

    fn resolve_open(&self, tag_id: Option<i64>, key: &str, at: DateTime<Utc>) -> Result<(), DbError> {
        let Some(alert) = self.store.find_open_alert(tag_id, key)? else {
            return Ok(());
        };
        match self.store.resolve_alert(alert.id, at) {
            Ok(()) => {
                tracing::info!("Alert {} resolved ({})", alert.id, key);
                Ok(())
            }
            // Resolved concurrently through the API.
            Err(DbError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn write_site(&self, update: &SiteUpdate) -> Result<(), DbError> {
        let site_id = update.check.site_id;
        self.store.update_site_check(&update.check)?;

        let key = site_condition_key(site_id);
        match &update.event {
            Some(SiteEvent::WentOffline { reason }) => {
                if self.store.find_open_alert(None, &key)?.is_some() {
                    return Ok(());
                }
                let id = self.store.insert_alert(&NewAlert {
                    site_id: Some(site_id),
                    tag_id: None,
                    condition_key: key,
                    alert_type: AlertType::CommunicationError,
                    severity: Severity::Critical,
                    title: format!("{} offline", update.site_name),
                    message: format!("Lost communication with {}: {}", update.site_name, reason),
                    metadata: json!({ "reason": reason }),
                    created_at: update.check.checked_at,
                })?;
                tracing::warn!("Site {} offline, alert {} opened", update.site_name, id);
                Ok(())
            }
            Some(SiteEvent::BackOnline) => self.resolve_open(None, &key, update.check.checked_at),
            // An alert left open by an earlier run has no BackOnline to close it.
            None if update.check.status == SiteStatus::Online => {
                self.resolve_open(None, &key, update.check.checked_at)
            }
            None => Ok(()),
        }
    }

    /// Drain `queue` until it is closed.
    pub async fn run(self, queue: Arc<WriteQueue>) {
        loop {
            let batch = queue.take();
            if batch.is_empty() {
                if queue.is_closed() {
                    break;
                }
                queue.wait().await;
                continue;
            }

            for update in &batch.sites {
                self.apply_site(update).await;
            }
            for job in &batch.jobs {
                self.apply(job).await;
            }
        }
        tracing::info!("Writer stopped");
    }
}

/// Producer side of the writer.
#[derive(Clone)]
pub struct WriterHandle {
    queue: Arc<WriteQueue>,
}

impl WriterHandle {
    pub fn submit(&self, job: WriteJob) {
        self.queue.push(job);
    }

    pub fn site_update(&self, update: SiteUpdate) {
        self.queue.push_site(update);
    }

    /// Stop accepting work once the queue drains.
    pub fn close(&self) {
        self.queue.close();
    }
}

/// Start the writer task.
pub fn spawn_writer(store: Arc<dyn TagPersistence>, config: &PollerConfig) -> (WriterHandle, JoinHandle<()>) {
    let queue = Arc::new(WriteQueue::new(config.write_queue_capacity));
    let writer = AlertWriter::new(store, config.persist_retries);
    let task = tokio::spawn(writer.run(queue.clone()));
    (WriterHandle { queue }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::detector::{classify, TagState};
    use crate::db::test_support::{new_tag, seed_site, test_store};
    use crate::db::{Alert, DataType, HistoryRow, Site, SiteCheck, SiteStatus, Store};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    const EPS: f64 = 1e-6;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn alarm_tag(store: &Store, site: &Site) -> PlcTag {
        let mut t = new_tag("T1", DataType::Bool);
        t.alarm_on_true = true;
        let ids = store.add_tags(site.id, &[t]).unwrap();
        store.get_tag(ids[0]).unwrap()
    }

    fn history(store: &Store, tag_id: i64) -> Vec<HistoryRow> {
        store.get_history(tag_id, 100).unwrap()
    }

    fn open_alerts(store: &Store) -> Vec<Alert> {
        store.get_alerts(true, 100).unwrap()
    }

    /// Classify a reading the way a poll task would and persist it.
    async fn poll(
        writer: &AlertWriter,
        tag: &Arc<PlcTag>,
        state: &mut TagState,
        value: bool,
        at: DateTime<Utc>,
    ) -> Transition {
        let transition = classify(tag, state, Ok(PlcValue::Bool(value)), EPS);
        let job = WriteJob {
            tag: tag.clone(),
            transition: transition.clone(),
            at,
        };
        writer.apply(&job).await;
        transition
    }

    #[tokio::test]
    async fn test_alarm_scenarios() {
        let (store, _tmp) = test_store();
        let site = seed_site(&store, "S1");
        let tag = Arc::new(alarm_tag(&store, &site));
        let writer = AlertWriter::new(Arc::new(store.clone()), 3);
        let mut state = TagState::new(&tag);

        // t0: first value, t1: alarm entered
        poll(&writer, &tag, &mut state, false, ts(0)).await;
        let tr = poll(&writer, &tag, &mut state, true, ts(1)).await;
        assert_eq!(tr.name(), "alarm_entered");

        let rows = history(&store, tag.id);
        assert_eq!(rows[0].old_value.as_deref(), Some("false"));
        assert_eq!(rows[0].new_value, "true");
        assert_eq!(rows[0].recorded_at, ts(1));

        let alerts = open_alerts(&store);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].condition_key.as_deref(), Some("T1:true"));
        assert_eq!(alerts[0].alert_type, AlertType::PlcTagAlarm);
        assert_eq!(alerts[0].tag_id, Some(tag.id));

        // t2: still true, nothing new
        let before = history(&store, tag.id).len();
        let tr = poll(&writer, &tag, &mut state, true, ts(2)).await;
        assert_eq!(tr, Transition::Unchanged);
        assert_eq!(history(&store, tag.id).len(), before);
        assert_eq!(store.get_alerts(false, 100).unwrap().len(), 1);
        assert_eq!(store.get_tag(tag.id).unwrap().last_read_time, Some(ts(2)));

        // t3: cleared
        poll(&writer, &tag, &mut state, false, ts(3)).await;
        let rows = history(&store, tag.id);
        assert_eq!(rows.len(), before + 1);
        assert_eq!(rows[0].old_value.as_deref(), Some("true"));
        assert_eq!(rows[0].new_value, "false");
        assert_eq!(rows[0].recorded_at, ts(3));

        let alert = store.get_alert(alerts[0].id).unwrap();
        assert!(alert.is_resolved);
        assert_eq!(alert.resolved_at, Some(ts(3)));
        assert!(open_alerts(&store).is_empty());

        // Re-entering after resolution opens a new alert.
        poll(&writer, &tag, &mut state, true, ts(4)).await;
        assert_eq!(open_alerts(&store).len(), 1);
        assert_eq!(store.get_alerts(false, 100).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replayed_job_is_idempotent() {
        let (store, _tmp) = test_store();
        let site = seed_site(&store, "S1");
        let tag = Arc::new(alarm_tag(&store, &site));
        let writer = AlertWriter::new(Arc::new(store.clone()), 3);

        let job = WriteJob {
            tag: tag.clone(),
            transition: Transition::AlarmEntered {
                old: Some(PlcValue::Bool(false)),
                new: PlcValue::Bool(true),
            },
            at: ts(5),
        };
        assert!(writer.apply(&job).await);
        assert!(writer.apply(&job).await);

        assert_eq!(history(&store, tag.id).len(), 1);
        assert_eq!(open_alerts(&store).len(), 1);
    }

    #[tokio::test]
    async fn test_critical_severity_is_a_trip() {
        let (store, _tmp) = test_store();
        let site = seed_site(&store, "S1");
        let mut t = new_tag("ESTOP", DataType::Bool);
        t.alarm_on_true = true;
        t.severity_level = Severity::Critical;
        let id = store.add_tags(site.id, &[t]).unwrap()[0];
        let tag = Arc::new(store.get_tag(id).unwrap());
        let writer = AlertWriter::new(Arc::new(store.clone()), 0);

        let mut state = TagState::new(&tag);
        poll(&writer, &tag, &mut state, true, ts(1)).await;

        let alerts = open_alerts(&store);
        assert_eq!(alerts[0].alert_type, AlertType::PlcTagTrip);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_failures_touch_without_overwriting_value() {
        let (store, _tmp) = test_store();
        let site = seed_site(&store, "S1");
        let id = store.add_tags(site.id, &[new_tag("Speed", DataType::Int)]).unwrap()[0];
        let tag = Arc::new(store.get_tag(id).unwrap());
        let writer = AlertWriter::new(Arc::new(store.clone()), 0);

        let mut state = TagState::new(&tag);
        let tr = classify(&tag, &mut state, Ok(PlcValue::Int(42)), EPS);
        writer.apply(&WriteJob { tag: tag.clone(), transition: tr, at: ts(0) }).await;

        for i in 1..=4 {
            let failure = crate::ads::PollFailure::Connect(crate::ads::ConnectFailure::Unreachable(
                "10.0.0.5".to_string(),
            ));
            let tr = classify(&tag, &mut state, Err(failure), EPS);
            writer.apply(&WriteJob { tag: tag.clone(), transition: tr, at: ts(i) }).await;

            let stored = store.get_tag(id).unwrap();
            assert_eq!(stored.last_value.as_deref(), Some("42"));
            assert_eq!(stored.last_read_time, Some(ts(i)));
        }
        assert_eq!(history(&store, id).len(), 1);
    }

    /// Store wrapper that fails the first `failures` change writes.
    struct FlakyStore {
        inner: Store,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn fail(&self) -> Result<(), DbError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(DbError::Migration("disk I/O error".to_string()));
            }
            Ok(())
        }
    }

    impl TagPersistence for FlakyStore {
        fn get_sites(&self) -> Result<Vec<Site>, DbError> {
            self.inner.get_sites()
        }
        fn get_active_tags(&self, site_id: Option<i64>) -> Result<Vec<PlcTag>, DbError> {
            self.inner.get_active_tags(site_id)
        }
        fn upsert_tag_value(&self, tag_id: i64, value: &str, at: DateTime<Utc>) -> Result<(), DbError> {
            self.inner.upsert_tag_value(tag_id, value, at)
        }
        fn touch_tag(&self, tag_id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
            self.inner.touch_tag(tag_id, at)
        }
        fn insert_history(
            &self,
            tag_id: i64,
            old_value: Option<&str>,
            new_value: &str,
            at: DateTime<Utc>,
        ) -> Result<(), DbError> {
            self.inner.insert_history(tag_id, old_value, new_value, at)
        }
        fn record_change(
            &self,
            tag_id: i64,
            old_value: Option<&str>,
            new_value: &str,
            at: DateTime<Utc>,
        ) -> Result<bool, DbError> {
            self.fail()?;
            self.inner.record_change(tag_id, old_value, new_value, at)
        }
        fn find_open_alert(&self, tag_id: Option<i64>, condition_key: &str) -> Result<Option<Alert>, DbError> {
            self.inner.find_open_alert(tag_id, condition_key)
        }
        fn insert_alert(&self, alert: &NewAlert) -> Result<i64, DbError> {
            self.inner.insert_alert(alert)
        }
        fn resolve_alert(&self, alert_id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
            self.inner.resolve_alert(alert_id, at)
        }
        fn resolve_tag_alerts(&self, tag_id: i64, at: DateTime<Utc>) -> Result<usize, DbError> {
            self.inner.resolve_tag_alerts(tag_id, at)
        }
        fn open_alert_tag_ids(&self) -> Result<std::collections::HashSet<i64>, DbError> {
            self.inner.open_alert_tag_ids()
        }
        fn update_site_check(&self, check: &SiteCheck) -> Result<(), DbError> {
            self.inner.update_site_check(check)
        }
    }

    fn changed_job(tag: &Arc<PlcTag>, n: i64, at: DateTime<Utc>) -> WriteJob {
        WriteJob {
            tag: tag.clone(),
            transition: Transition::Changed {
                old: None,
                new: PlcValue::Int(n),
            },
            at,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let (store, _tmp) = test_store();
        let site = seed_site(&store, "S1");
        let id = store.add_tags(site.id, &[new_tag("Speed", DataType::Int)]).unwrap()[0];
        let tag = Arc::new(store.get_tag(id).unwrap());
        let flaky = Arc::new(FlakyStore {
            inner: store.clone(),
            failures: AtomicU32::new(2),
        });
        let writer = AlertWriter::new(flaky, 3);

        assert!(writer.apply(&changed_job(&tag, 9, ts(1))).await);
        assert_eq!(store.get_tag(id).unwrap().last_value.as_deref(), Some("9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_is_dropped() {
        let (store, _tmp) = test_store();
        let site = seed_site(&store, "S1");
        let id = store.add_tags(site.id, &[new_tag("Speed", DataType::Int)]).unwrap()[0];
        let tag = Arc::new(store.get_tag(id).unwrap());
        let flaky = Arc::new(FlakyStore {
            inner: store.clone(),
            failures: AtomicU32::new(4),
        });
        let writer = AlertWriter::new(flaky, 3);

        assert!(!writer.apply(&changed_job(&tag, 9, ts(1))).await);
        assert!(history(&store, id).is_empty());

        // The writer keeps going afterwards.
        assert!(writer.apply(&changed_job(&tag, 10, ts(2))).await);
        assert_eq!(history(&store, id).len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_tag_is_skipped() {
        let (store, _tmp) = test_store();
        let site = seed_site(&store, "S1");
        let id = store.add_tags(site.id, &[new_tag("Speed", DataType::Int)]).unwrap()[0];
        let tag = Arc::new(store.get_tag(id).unwrap());
        store.delete_tag(id).unwrap();

        let writer = AlertWriter::new(Arc::new(store.clone()), 3);
        assert!(!writer.apply(&changed_job(&tag, 1, ts(1))).await);
    }

    fn site_update(site: &Site, status: SiteStatus, event: Option<SiteEvent>, at: DateTime<Utc>) -> SiteUpdate {
        SiteUpdate {
            site_name: site.name.clone(),
            check: SiteCheck {
                site_id: site.id,
                status,
                checked_at: at,
                last_online: None,
                uptime_percent: 40.0,
            },
            event,
        }
    }

    #[tokio::test]
    async fn test_site_offline_alert_lifecycle() {
        let (store, _tmp) = test_store();
        let site = seed_site(&store, "S1");
        let writer = AlertWriter::new(Arc::new(store.clone()), 3);
        let offline = || {
            Some(SiteEvent::WentOffline {
                reason: "unreachable".to_string(),
            })
        };

        writer.apply_site(&site_update(&site, SiteStatus::Offline, offline(), ts(1))).await;
        writer.apply_site(&site_update(&site, SiteStatus::Offline, offline(), ts(2))).await;

        let alerts = open_alerts(&store);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::CommunicationError);
        assert_eq!(alerts[0].tag_id, None);
        assert_eq!(alerts[0].condition_key, Some(site_condition_key(site.id)));
        assert_eq!(store.get_site(site.id).unwrap().status, SiteStatus::Offline);

        writer
            .apply_site(&site_update(&site, SiteStatus::Online, Some(SiteEvent::BackOnline), ts(3)))
            .await;
        assert!(open_alerts(&store).is_empty());
        let alert = store.get_alert(alerts[0].id).unwrap();
        assert_eq!(alert.resolved_at, Some(ts(3)));
        assert_eq!(store.get_site(site.id).unwrap().status, SiteStatus::Online);
    }

    #[tokio::test]
    async fn test_online_check_closes_alert_from_earlier_run() {
        let (store, _tmp) = test_store();
        let site = seed_site(&store, "S1");
        let writer = AlertWriter::new(Arc::new(store.clone()), 3);
        writer
            .apply_site(&site_update(
                &site,
                SiteStatus::Offline,
                Some(SiteEvent::WentOffline {
                    reason: "unreachable".to_string(),
                }),
                ts(1),
            ))
            .await;
        assert_eq!(open_alerts(&store).len(), 1);

        // A fresh health tracker reports online without a BackOnline event.
        writer.apply_site(&site_update(&site, SiteStatus::Warning, None, ts(2))).await;
        assert_eq!(open_alerts(&store).len(), 1);
        writer.apply_site(&site_update(&site, SiteStatus::Online, None, ts(3))).await;
        assert!(open_alerts(&store).is_empty());
    }

    #[tokio::test]
    async fn test_clear_resolves_alert_raised_under_old_name() {
        let (store, _tmp) = test_store();
        let site = seed_site(&store, "S1");
        let tag = Arc::new(alarm_tag(&store, &site));
        let writer = AlertWriter::new(Arc::new(store.clone()), 3);

        let mut state = TagState::new(&tag);
        poll(&writer, &tag, &mut state, true, ts(1)).await;
        assert_eq!(open_alerts(&store)[0].condition_key.as_deref(), Some("T1:true"));

        let mut renamed = (*tag).clone();
        renamed.tag_name = "T1-renamed".to_string();
        store.update_tag(&renamed).unwrap();
        let renamed = Arc::new(store.get_tag(tag.id).unwrap());

        let mut state = TagState::new(&renamed);
        let tr = poll(&writer, &renamed, &mut state, false, ts(2)).await;
        assert_eq!(tr.name(), "alarm_cleared");
        assert!(open_alerts(&store).is_empty());
    }

    #[tokio::test]
    async fn test_spawned_writer_drains_on_close() {
        let (store, _tmp) = test_store();
        let site = seed_site(&store, "S1");
        let id = store.add_tags(site.id, &[new_tag("Speed", DataType::Int)]).unwrap()[0];
        let tag = Arc::new(store.get_tag(id).unwrap());

        let (handle, task) = spawn_writer(Arc::new(store.clone()), &PollerConfig::default());
        handle.submit(changed_job(&tag, 1, ts(1)));
        handle.close();
        task.await.unwrap();

        assert_eq!(store.get_tag(id).unwrap().last_value.as_deref(), Some("1"));
    }
}
