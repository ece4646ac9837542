//! Site health debounce.

use crate::alerting::{SiteEvent, SiteUpdate};
use crate::ads::PollFailure;
use crate::db::{SiteCheck, SiteStatus};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Outcomes kept for the rolling uptime figure.
pub const UPTIME_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub offline_after: u32,
    pub warning_after: u32,
    pub slow_read: Duration,
}

/// What a single read told us about a site.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    Success { elapsed: Duration },
    Failure { reason: String },
}

impl ReadOutcome {
    /// Map a poll result, ignoring failures that are not about reachability.
    pub fn from_poll<T>(result: &Result<T, PollFailure>, elapsed: Duration) -> Option<Self> {
        match result {
            Ok(_) => Some(ReadOutcome::Success { elapsed }),
            Err(f) if f.is_comms() => Some(ReadOutcome::Failure {
                reason: f.to_string(),
            }),
            Err(_) => None,
        }
    }
}

/// Debounced status of one site.
#[derive(Debug, Clone)]
pub struct SiteHealth {
    policy: HealthPolicy,
    status: SiteStatus,
    consecutive_failures: u32,
    outcomes: VecDeque<bool>,
    last_online: Option<DateTime<Utc>>,
}

impl SiteHealth {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            status: SiteStatus::Unknown,
            consecutive_failures: 0,
            outcomes: VecDeque::with_capacity(UPTIME_WINDOW),
            last_online: None,
        }
    }

    pub fn status(&self) -> SiteStatus {
        self.status
    }

    /// Fold one outcome in and return the resulting check plus the event it
    /// triggered.
    pub fn record(&mut self, outcome: &ReadOutcome, at: DateTime<Utc>) -> (SiteCheck, Option<SiteEvent>) {
        let previous = self.status;
        let ok = matches!(outcome, ReadOutcome::Success { .. });
        if self.outcomes.len() == UPTIME_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);

        match outcome {
            ReadOutcome::Success { elapsed } => {
                self.consecutive_failures = 0;
                self.last_online = Some(at);
                self.status = if *elapsed > self.policy.slow_read {
                    SiteStatus::Warning
                } else {
                    SiteStatus::Online
                };
            }
            ReadOutcome::Failure { .. } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.policy.offline_after {
                    self.status = SiteStatus::Offline;
                } else if self.consecutive_failures >= self.policy.warning_after {
                    self.status = SiteStatus::Warning;
                }
            }
        }

        let event = match (previous, self.status, outcome) {
            (SiteStatus::Offline, SiteStatus::Offline, _) => None,
            (_, SiteStatus::Offline, ReadOutcome::Failure { reason }) => Some(SiteEvent::WentOffline {
                reason: reason.clone(),
            }),
            (SiteStatus::Offline, _, _) => Some(SiteEvent::BackOnline),
            _ => None,
        };

        let check = SiteCheck {
            site_id: 0,
            status: self.status,
            checked_at: at,
            last_online: if ok { self.last_online } else { None },
            uptime_percent: self.uptime_percent(),
        };
        (check, event)
    }

    pub fn uptime_percent(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let ok = self.outcomes.iter().filter(|&&o| o).count();
        ok as f64 * 100.0 / self.outcomes.len() as f64
    }
}

/// Health of every polled site, shared by all poll tasks.
pub struct HealthBoard {
    policy: HealthPolicy,
    sites: Mutex<HashMap<i64, SiteHealth>>,
}

impl HealthBoard {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            sites: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, site_id: i64, site_name: &str, outcome: &ReadOutcome, at: DateTime<Utc>) -> SiteUpdate {
        let mut sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
        let health = sites
            .entry(site_id)
            .or_insert_with(|| SiteHealth::new(self.policy));
        let (mut check, event) = health.record(outcome, at);
        check.site_id = site_id;
        SiteUpdate {
            site_name: site_name.to_string(),
            check,
            event,
        }
    }

    pub fn status(&self, site_id: i64) -> Option<SiteStatus> {
        let sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
        sites.get(&site_id).map(SiteHealth::status)
    }

    /// Drop state for sites that are no longer polled.
    pub fn retain(&self, site_ids: &HashSet<i64>) {
        let mut sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
        sites.retain(|id, _| site_ids.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads::{ConnectFailure, ReadFailure};

    fn policy() -> HealthPolicy {
        HealthPolicy {
            offline_after: 3,
            warning_after: 2,
            slow_read: Duration::from_secs(1),
        }
    }

    fn fail() -> ReadOutcome {
        ReadOutcome::Failure {
            reason: "endpoint unreachable".to_string(),
        }
    }

    fn ok(ms: u64) -> ReadOutcome {
        ReadOutcome::Success {
            elapsed: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_offline_after_threshold_then_back_online() {
        let mut h = SiteHealth::new(policy());
        h.record(&ok(20), Utc::now());

        let mut statuses = Vec::new();
        let mut events = Vec::new();
        for _ in 0..5 {
            let (check, event) = h.record(&fail(), Utc::now());
            statuses.push(check.status);
            events.extend(event);
        }
        assert_eq!(
            statuses,
            vec![
                SiteStatus::Online,
                SiteStatus::Warning,
                SiteStatus::Offline,
                SiteStatus::Offline,
                SiteStatus::Offline,
            ]
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SiteEvent::WentOffline { .. }));

        let (check, event) = h.record(&ok(20), Utc::now());
        assert_eq!(check.status, SiteStatus::Online);
        assert_eq!(event, Some(SiteEvent::BackOnline));
    }

    #[test]
    fn test_slow_read_is_warning() {
        let mut h = SiteHealth::new(policy());
        let (check, _) = h.record(&ok(1500), Utc::now());
        assert_eq!(check.status, SiteStatus::Warning);
        let (check, _) = h.record(&ok(10), Utc::now());
        assert_eq!(check.status, SiteStatus::Online);
    }

    #[test]
    fn test_uptime_window() {
        let mut h = SiteHealth::new(policy());
        for _ in 0..150 {
            h.record(&fail(), Utc::now());
        }
        for _ in 0..50 {
            h.record(&ok(5), Utc::now());
        }
        assert_eq!(h.uptime_percent(), 50.0);
    }

    #[test]
    fn test_tag_level_failures_do_not_count() {
        let missing: Result<(), PollFailure> = Err(ReadFailure::SymbolNotFound("MAIN.x".to_string()).into());
        assert!(ReadOutcome::from_poll(&missing, Duration::ZERO).is_none());

        let down: Result<(), PollFailure> = Err(ConnectFailure::Unreachable("10.0.0.5".to_string()).into());
        assert!(matches!(
            ReadOutcome::from_poll(&down, Duration::ZERO),
            Some(ReadOutcome::Failure { .. })
        ));
    }

    #[test]
    fn test_board_tracks_sites_separately() {
        let board = HealthBoard::new(policy());
        for _ in 0..3 {
            board.record(1, "S1", &fail(), Utc::now());
        }
        let update = board.record(2, "S2", &ok(5), Utc::now());
        assert_eq!(update.check.site_id, 2);
        assert_eq!(board.status(1), Some(SiteStatus::Offline));
        assert_eq!(board.status(2), Some(SiteStatus::Online));

        board.retain(&HashSet::from([2]));
        assert_eq!(board.status(1), None);
    }
}
