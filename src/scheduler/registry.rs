//! Tag registry: the set of tags the scheduler should be polling.
//!
//! The registry holds an immutable snapshot behind an `Arc`. Reloads build a
//! new snapshot and swap it in, so readers never see a half-applied update.

use crate::ads::Endpoint;
use crate::db::{DbError, PlcTag, TagPersistence};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Notify;

/// A polled site: its display name and PLC endpoint.
#[derive(Debug, Clone)]
pub struct SiteTarget {
    pub name: String,
    pub endpoint: Endpoint,
}

/// One consistent view of active tags.
#[derive(Debug, Default)]
pub struct Snapshot {
    tags_by_site: HashMap<i64, Vec<PlcTag>>,
    sites: HashMap<i64, SiteTarget>,
    open_alerts: HashSet<i64>,
    loaded_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// Active tags grouped by site. Sites without a usable endpoint are absent.
    pub fn active_tags_by_site(&self) -> &HashMap<i64, Vec<PlcTag>> {
        &self.tags_by_site
    }

    pub fn connection_for(&self, tag: &PlcTag) -> Option<&Endpoint> {
        self.sites.get(&tag.site_id).map(|s| &s.endpoint)
    }

    pub fn site(&self, site_id: i64) -> Option<&SiteTarget> {
        self.sites.get(&site_id)
    }

    /// Whether the tag had an unresolved alert when the snapshot was taken.
    pub fn has_open_alert(&self, tag_id: i64) -> bool {
        self.open_alerts.contains(&tag_id)
    }

    pub fn tags(&self) -> impl Iterator<Item = &PlcTag> {
        self.tags_by_site.values().flatten()
    }

    pub fn tag_count(&self) -> usize {
        self.tags_by_site.values().map(Vec::len).sum()
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }
}

pub struct TagRegistry {
    store: Arc<dyn TagPersistence>,
    current: RwLock<Arc<Snapshot>>,
    changed: Notify,
}

impl TagRegistry {
    pub fn new(store: Arc<dyn TagPersistence>) -> Self {
        Self {
            store,
            current: RwLock::new(Arc::new(Snapshot::default())),
            changed: Notify::new(),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reload from the store and publish a new snapshot.
    pub fn reload(&self) -> Result<Arc<Snapshot>, DbError> {
        let sites = self.store.get_sites()?;
        let tags = self.store.get_active_tags(None)?;
        let open_alerts = self.store.open_alert_tag_ids()?;

        let mut targets = HashMap::new();
        for site in sites {
            let Some(net_id) = site.ams_net_id.as_deref().filter(|s| !s.trim().is_empty()) else {
                continue;
            };
            match Endpoint::new(&site.address, net_id, site.ams_port) {
                Ok(endpoint) => {
                    targets.insert(
                        site.id,
                        SiteTarget {
                            name: site.name,
                            endpoint,
                        },
                    );
                }
                Err(e) => tracing::warn!("Site {} has an unusable PLC endpoint: {}", site.name, e),
            }
        }

        let mut tags_by_site: HashMap<i64, Vec<PlcTag>> = HashMap::new();
        let mut skipped = 0usize;
        for tag in tags {
            if targets.contains_key(&tag.site_id) {
                tags_by_site.entry(tag.site_id).or_default().push(tag);
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            tracing::warn!("Skipping {} active tags on sites without an AMS net ID", skipped);
        }

        let snapshot = Arc::new(Snapshot {
            tags_by_site,
            sites: targets,
            open_alerts,
            loaded_at: Some(Utc::now()),
        });
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        Ok(snapshot)
    }

    /// Ask for a reload as soon as possible. Called after tag edits.
    pub fn request_refresh(&self) {
        self.changed.notify_one();
    }

    /// Resolves once a refresh has been requested.
    pub async fn refresh_requested(&self) {
        self.changed.notified().await;
    }
}
