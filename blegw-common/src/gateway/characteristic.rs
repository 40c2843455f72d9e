use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::*;
use uuid::Uuid;

use crate::config::CharacteristicConfig;

/// A configured characteristic of a discovered service.
///
/// Holds no behavior of its own, only the read/notify policy and the bookkeeping of the requests
/// its service issued for it.
#[derive(Clone, Debug)]
pub struct Characteristic {
    pub uuid: Uuid,
    /// Owning service, lookup only
    pub service: Uuid,
    pub notify: bool,
    pub read_interval: Option<Duration>,
    read_pending: bool,
    subscribe_pending: bool,
    subscribed: bool,
    next_read: Option<Instant>,
    last_value_at: Option<DateTime<Utc>>,
}

impl Characteristic {
    pub fn from_config(service: Uuid, config: &CharacteristicConfig) -> Self {
        Self {
            uuid: config.uuid,
            service,
            notify: config.notify,
            read_interval: config.read_interval(),
            read_pending: false,
            subscribe_pending: false,
            subscribed: false,
            next_read: None,
            last_value_at: None,
        }
    }

    pub fn has_pending_response(&self) -> bool {
        self.read_pending || self.subscribe_pending
    }

    pub fn is_read_pending(&self) -> bool {
        self.read_pending
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn last_value_at(&self) -> Option<DateTime<Utc>> {
        self.last_value_at
    }

    pub fn next_read(&self) -> Option<Instant> {
        self.next_read
    }

    /// Schedules the first periodic read right away, no-op for characteristics without interval
    pub fn arm(&mut self, now: Instant) {
        if self.read_interval.is_some() {
            self.next_read = Some(now);
        }
    }

    /// Returns true when a periodic read must go out at `now`.
    ///
    /// A read still in flight at that point is overdue: it is issued again but the pending flag
    /// stays a single entry.
    pub fn take_due_read(&mut self, now: Instant) -> bool {
        let (Some(interval), Some(due)) = (self.read_interval, self.next_read) else {
            return false;
        };

        if due > now {
            return false;
        }

        if self.read_pending {
            warn!(
                "Read of characteristic {} is overdue, issuing it again",
                self.uuid
            );
        }

        self.read_pending = true;
        self.next_read = Some(now + interval);

        true
    }

    /// Explicit read outside of the schedule, refused while one is already outstanding
    pub fn request_read(&mut self) -> bool {
        if self.read_pending {
            return false;
        }

        self.read_pending = true;
        true
    }

    pub fn request_subscribe(&mut self) -> bool {
        if !self.notify || self.subscribed || self.subscribe_pending {
            return false;
        }

        self.subscribe_pending = true;
        true
    }

    pub fn on_read_complete(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.read_pending = false;
        self.last_value_at = Some(now);

        now
    }

    /// The next tick retries, there is no backoff at this level
    pub fn on_read_failed(&mut self) {
        self.read_pending = false;
    }

    pub fn on_subscribed(&mut self) {
        self.subscribe_pending = false;
        self.subscribed = true;
    }

    pub fn on_subscribe_failed(&mut self) {
        self.subscribe_pending = false;
    }

    pub fn on_notification(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.last_value_at = Some(now);

        now
    }

    /// Clears pending bookkeeping without touching the schedule
    pub fn clear_pending(&mut self) {
        self.read_pending = false;
        self.subscribe_pending = false;
    }

    /// Subscriptions and schedules do not survive a disconnect
    pub fn reset(&mut self) {
        self.clear_pending();
        self.subscribed = false;
        self.next_read = None;
    }
}
