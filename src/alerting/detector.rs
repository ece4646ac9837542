//! Value change detection.
//!
//! Each poll outcome is classified against the tag's in-memory state. The
//! state is owned by the tag's poll task; persistence only mirrors it.

use crate::ads::PollFailure;
use crate::db::{PlcTag, PlcValue};

/// Alarm state of one (tag, condition) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Open,
    Resolved,
}

/// An alarm edge carried by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmEdge {
    Entered,
    Cleared,
}

/// Result of classifying one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The read failed; the previous value is retained.
    ConnectionFailed { failure: PollFailure },
    /// First good read after one or more failures. `alarm` is the edge the
    /// recovered value produces, if any.
    Recovered {
        old: Option<PlcValue>,
        new: PlcValue,
        alarm: Option<AlarmEdge>,
    },
    AlarmEntered { old: Option<PlcValue>, new: PlcValue },
    AlarmCleared { old: Option<PlcValue>, new: PlcValue },
    Changed { old: Option<PlcValue>, new: PlcValue },
    Unchanged,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::ConnectionFailed { .. } => "connection_failed",
            Transition::Recovered { .. } => "recovered",
            Transition::AlarmEntered { .. } => "alarm_entered",
            Transition::AlarmCleared { .. } => "alarm_cleared",
            Transition::Changed { .. } => "changed",
            Transition::Unchanged => "unchanged",
        }
    }

    /// The alarm edge this transition carries.
    pub fn alarm_edge(&self) -> Option<AlarmEdge> {
        match self {
            Transition::AlarmEntered { .. } => Some(AlarmEdge::Entered),
            Transition::AlarmCleared { .. } => Some(AlarmEdge::Cleared),
            Transition::Recovered { alarm, .. } => *alarm,
            _ => None,
        }
    }

    /// Old and new value, for transitions that write history.
    pub fn values(&self) -> Option<(Option<&PlcValue>, &PlcValue)> {
        match self {
            Transition::Recovered { old, new, .. }
            | Transition::AlarmEntered { old, new }
            | Transition::AlarmCleared { old, new }
            | Transition::Changed { old, new } => Some((old.as_ref(), new)),
            Transition::ConnectionFailed { .. } | Transition::Unchanged => None,
        }
    }
}

/// Per-tag detector state.
#[derive(Debug, Clone)]
pub struct TagState {
    last_value: Option<PlcValue>,
    alarm: AlarmState,
    failing: bool,
}

impl TagState {
    /// Seed state from the persisted last value.
    pub fn new(tag: &PlcTag) -> Self {
        let last_value = tag.last_typed_value();
        let alarm = match &last_value {
            Some(v) if tag.alarm_satisfied(v) => AlarmState::Open,
            _ => AlarmState::Resolved,
        };
        Self {
            last_value,
            alarm,
            failing: false,
        }
    }

    /// Treat the alarm as open when the tag still has an unresolved alert,
    /// even if the last value no longer satisfies the current policy.
    pub fn with_open_alert(mut self, open_alert: bool) -> Self {
        if open_alert {
            self.alarm = AlarmState::Open;
        }
        self
    }

    pub fn last_value(&self) -> Option<&PlcValue> {
        self.last_value.as_ref()
    }

    pub fn alarm(&self) -> AlarmState {
        self.alarm
    }

    pub fn is_failing(&self) -> bool {
        self.failing
    }
}

/// Classify a poll outcome and advance `state`.
pub fn classify(
    tag: &PlcTag,
    state: &mut TagState,
    outcome: Result<PlcValue, PollFailure>,
    epsilon: f64,
) -> Transition {
    let new = match outcome {
        Ok(v) => v,
        Err(failure) => {
            state.failing = true;
            return Transition::ConnectionFailed { failure };
        }
    };

    let satisfied = tag.alarm_satisfied(&new);
    let edge = match (state.alarm, satisfied) {
        (AlarmState::Resolved, true) => Some(AlarmEdge::Entered),
        (AlarmState::Open, false) => Some(AlarmEdge::Cleared),
        _ => None,
    };
    match edge {
        Some(AlarmEdge::Entered) => state.alarm = AlarmState::Open,
        Some(AlarmEdge::Cleared) => state.alarm = AlarmState::Resolved,
        None => {}
    }

    let changed = match &state.last_value {
        Some(old) => !old.same_as(&new, epsilon),
        None => true,
    };
    let old = if changed {
        state.last_value.replace(new.clone())
    } else {
        state.last_value.clone()
    };

    if state.failing {
        state.failing = false;
        return Transition::Recovered { old, new, alarm: edge };
    }

    match edge {
        Some(AlarmEdge::Entered) => Transition::AlarmEntered { old, new },
        Some(AlarmEdge::Cleared) => Transition::AlarmCleared { old, new },
        None if changed => Transition::Changed { old, new },
        None => Transition::Unchanged,
    }
}
