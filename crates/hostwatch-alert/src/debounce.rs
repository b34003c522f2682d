use chrono::{DateTime, Duration, Utc};

use crate::evaluate::Status;

/// A reported status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Status,
    pub to: Status,
}

/// Debounce state of one (rule, host) pair.
///
/// A status differing from the reported one is held as pending; it is
/// reported once it has been observed continuously for `timing`.
///
/// From `Normal`, Warning and Critical readings count as one breach: the
/// pending period runs from the first breaching reading and the transition
/// carries the severity of the latest one. While a breach is reported, each
/// other status is debounced on its own and observing a different one
/// restarts the pending period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Debounce {
    reported: Status,
    pending: Option<(Status, DateTime<Utc>)>,
}

impl Default for Debounce {
    fn default() -> Self {
        Self::new(Status::Normal)
    }
}

impl Debounce {
    pub fn new(reported: Status) -> Self {
        Self {
            reported,
            pending: None,
        }
    }

    pub fn reported(&self) -> Status {
        self.reported
    }

    pub fn pending(&self) -> Option<(Status, DateTime<Utc>)> {
        self.pending
    }

    fn continues(&self, pending: Status, status: Status) -> bool {
        if self.reported == Status::Normal {
            pending.severity().is_some() && status.severity().is_some()
        } else {
            pending == status
        }
    }

    pub fn observe(&mut self, status: Status, now: DateTime<Utc>, timing: Duration) -> Option<Transition> {
        if status == self.reported {
            self.pending = None;
            return None;
        }

        let since = match self.pending {
            Some((pending, since)) if self.continues(pending, status) => since,
            _ => now,
        };
        self.pending = Some((status, since));

        if now - since < timing {
            return None;
        }

        let transition = Transition {
            from: self.reported,
            to: status,
        };
        self.reported = status;
        self.pending = None;
        Some(transition)
    }
}
