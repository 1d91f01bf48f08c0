use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(test)]
use std::{sync::Arc, time::Duration};

#[cfg(test)]
use parking_lot::RwLock;

/// A source of wall-clock time, expressed in whole seconds since the Unix
/// epoch.
///
/// Entry lifetimes are persisted into tom documents as epoch seconds
/// (`date_created`), so the clock must be a wall clock rather than a
/// monotonic one. Tests swap in a mocked source so that expiry can be
/// exercised without sleeping.
#[derive(Default, Clone)]
pub(crate) struct Clock {
    ty: ClockType,
}

#[derive(Clone)]
enum ClockType {
    /// Reads `std::time::SystemTime`.
    System,
    #[cfg(test)]
    /// Reads a mocked, manually advanced source of time.
    Mocked { mock: Arc<Mock> },
}

impl Default for ClockType {
    fn default() -> Self {
        ClockType::System
    }
}

impl Clock {
    #[cfg(test)]
    /// Creates a new `Clock` with a mocked source of time.
    pub(crate) fn mock() -> (Clock, Arc<Mock>) {
        let mock = Arc::new(Mock::default());
        let clock = Clock {
            ty: ClockType::Mocked {
                mock: Arc::clone(&mock),
            },
        };
        (clock, mock)
    }

    /// Returns the current time as whole seconds since the Unix epoch.
    pub(crate) fn now_secs(&self) -> u64 {
        match &self.ty {
            ClockType::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            #[cfg(test)]
            ClockType::Mocked { mock } => mock.now_secs(),
        }
    }
}

#[cfg(test)]
pub(crate) struct Mock {
    now: RwLock<u64>,
}

#[cfg(test)]
impl Default for Mock {
    fn default() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            now: RwLock::new(now),
        }
    }
}

#[cfg(test)]
impl Mock {
    pub(crate) fn increment(&self, amount: Duration) {
        *self.now.write() += amount.as_secs();
    }

    fn now_secs(&self) -> u64 {
        *self.now.read()
    }
}
