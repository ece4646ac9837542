//! Pending writes between the poll tasks and the writer.
//!
//! Each tag gets a bounded queue. When a queue overflows the oldest
//! touch-only write goes first, then the oldest plain value write. Alarm
//! writes are never shed, and neither are site events.

use super::detector::Transition;
use crate::db::{PlcTag, SiteCheck};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// One classified poll waiting to be persisted.
#[derive(Debug, Clone)]
pub struct WriteJob {
    pub tag: Arc<PlcTag>,
    pub transition: Transition,
    pub at: DateTime<Utc>,
}

/// How hard the queue tries to keep a job under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Only advances `last_read_time`.
    TouchOnly,
    /// Writes history without an alarm edge.
    Value,
    /// Carries an alarm edge; never dropped.
    Required,
}

impl WriteJob {
    pub fn retention(&self) -> Retention {
        match &self.transition {
            Transition::Unchanged | Transition::ConnectionFailed { .. } => Retention::TouchOnly,
            Transition::Changed { .. } | Transition::Recovered { alarm: None, .. } => Retention::Value,
            Transition::AlarmEntered { .. }
            | Transition::AlarmCleared { .. }
            | Transition::Recovered { alarm: Some(_), .. } => Retention::Required,
        }
    }
}

/// A change in a site's communication state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteEvent {
    WentOffline { reason: String },
    BackOnline,
}

/// Result of a site check plus the event it triggered, if any.
#[derive(Debug, Clone)]
pub struct SiteUpdate {
    pub site_name: String,
    pub check: SiteCheck,
    pub event: Option<SiteEvent>,
}

/// Bounded FIFO for one tag.
#[derive(Debug)]
pub struct TagQueue {
    capacity: usize,
    jobs: VecDeque<WriteJob>,
}

impl TagQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            jobs: VecDeque::new(),
        }
    }

    /// Append a job, returning whatever had to be shed to make room.
    pub fn push(&mut self, job: WriteJob) -> Option<WriteJob> {
        self.jobs.push_back(job);
        if self.jobs.len() <= self.capacity {
            return None;
        }
        for class in [Retention::TouchOnly, Retention::Value] {
            if let Some(idx) = self.jobs.iter().position(|j| j.retention() == class) {
                return self.jobs.remove(idx);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn drain(&mut self) -> impl Iterator<Item = WriteJob> + '_ {
        self.jobs.drain(..)
    }
}

/// Everything taken from the queue in one pass.
#[derive(Debug, Default)]
pub struct Batch {
    pub jobs: Vec<WriteJob>,
    pub sites: Vec<SiteUpdate>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.sites.is_empty()
    }
}

#[derive(Default)]
struct Pending {
    tags: BTreeMap<i64, TagQueue>,
    sites: Vec<SiteUpdate>,
}

/// Shared queue feeding the writer task.
pub struct WriteQueue {
    capacity: usize,
    pending: Mutex<Pending>,
    notify: Notify,
    closed: AtomicBool,
}

impl WriteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: Mutex::new(Pending::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, job: WriteJob) {
        let tag_id = job.tag.id;
        let shed = {
            let mut pending = self.lock();
            pending
                .tags
                .entry(tag_id)
                .or_insert_with(|| TagQueue::new(self.capacity))
                .push(job)
        };
        if let Some(shed) = shed {
            tracing::warn!(
                "Write queue full for tag {}, dropped {} write from {}",
                tag_id,
                shed.transition.name(),
                shed.at
            );
        }
        self.notify.notify_one();
    }

    /// Queue a site update. A plain check replaces the site's previous plain
    /// check unless an event was queued after it; events are always kept.
    pub fn push_site(&self, update: SiteUpdate) {
        {
            let mut pending = self.lock();
            let last = pending
                .sites
                .iter()
                .rposition(|u| u.check.site_id == update.check.site_id);
            match last {
                Some(idx) if update.event.is_none() && pending.sites[idx].event.is_none() => {
                    pending.sites[idx] = update;
                }
                _ => pending.sites.push(update),
            }
        }
        self.notify.notify_one();
    }

    /// Take everything pending. Per-tag order is preserved.
    pub fn take(&self) -> Batch {
        let mut pending = self.lock();
        let mut batch = Batch::default();
        for queue in pending.tags.values_mut() {
            batch.jobs.extend(queue.drain());
        }
        pending.tags.retain(|_, q| !q.is_empty());
        batch.sites = std::mem::take(&mut pending.sites);
        batch
    }

    /// Wait until something is pushed or the queue is closed.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_for(&self, tag_id: i64) -> usize {
        self.lock().tags.get(&tag_id).map(TagQueue::len).unwrap_or(0)
    }
}
