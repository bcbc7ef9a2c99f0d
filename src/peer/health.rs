use crate::peer::types::ConnectivityStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Pending,
    Terminal,
}

pub fn classify(status: ConnectivityStatus) -> Health {
    match status {
        ConnectivityStatus::Connected | ConnectivityStatus::Completed => Health::Healthy,
        ConnectivityStatus::New | ConnectivityStatus::Checking => Health::Pending,
        ConnectivityStatus::Disconnected
        | ConnectivityStatus::Failed
        | ConnectivityStatus::Closed => Health::Terminal,
    }
}

/// What the session should do about a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Pending,
    /// Terminal status caused by our own hang-up.
    ExpectedClose,
    /// Terminal status nobody on this side asked for.
    RemoteLost,
}

/// Connection health of one session.
///
/// The hang-up flag must be raised before the connection is closed locally,
/// otherwise the resulting `closed` status reads as a remote failure.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    local_hangup: bool,
}

impl HealthMonitor {
    pub fn mark_local_hangup(&mut self) {
        self.local_hangup = true;
    }

    pub fn is_local_hangup(&self) -> bool {
        self.local_hangup
    }

    pub fn reset(&mut self) {
        self.local_hangup = false;
    }

    pub fn assess(&self, status: ConnectivityStatus) -> Verdict {
        match classify(status) {
            Health::Healthy => Verdict::Healthy,
            Health::Pending => Verdict::Pending,
            Health::Terminal if self.local_hangup => Verdict::ExpectedClose,
            Health::Terminal => Verdict::RemoteLost,
        }
    }
}
