//! Online-team presence and the new-ticket alert overlay.
//!
//! Presence is only meaningful while connected: the set is replaced
//! wholesale by a roster snapshot after each (re)connect and cleared on
//! disconnect, so a stale roster is never shown as live.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::WallClock;
use crate::model::{UserId, UserRole};

/// One online session descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub id: UserId,
    pub role: UserRole,
    #[serde(default)]
    pub team: Option<String>,
}

/// Side-effect seam for the audible alert; the UI shell provides the sound.
pub trait AlertSink {
    fn new_ticket_alert(&self);
}

pub struct PresenceTracker {
    online: BTreeMap<UserId, PresenceUser>,
    local: Option<PresenceUser>,
    cooldown_ms: u64,
    last_alert: Option<WallClock>,
    /// Armed only after the first ticket bulk load completes, so initial
    /// population is never mistaken for new activity.
    armed: bool,
}

impl PresenceTracker {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            online: BTreeMap::new(),
            local: None,
            cooldown_ms,
            last_alert: None,
            armed: false,
        }
    }

    /// Identity of the local session, for the audience check.
    pub fn set_local_session(&mut self, user: Option<PresenceUser>) {
        self.local = user;
    }

    /// Wholesale replacement from a roster snapshot.
    pub fn replace_roster(&mut self, users: Vec<PresenceUser>) {
        self.online = users.into_iter().map(|u| (u.id.clone(), u)).collect();
    }

    /// Idempotent insert from a join delta.
    pub fn apply_join(&mut self, user: PresenceUser) {
        self.online.entry(user.id.clone()).or_insert(user);
    }

    pub fn apply_leave(&mut self, id: &UserId) {
        self.online.remove(id);
    }

    pub fn is_online(&self, id: &UserId) -> bool {
        self.online.contains_key(id)
    }

    pub fn online(&self) -> Vec<PresenceUser> {
        self.online.values().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Connect resets the overlay: alerts stay disarmed until the first
    /// ticket load lands.
    pub fn on_connected(&mut self) {
        self.armed = false;
        self.last_alert = None;
    }

    pub fn on_disconnected(&mut self) {
        self.online.clear();
        self.armed = false;
    }

    /// Call when the initial ticket bulk load has been applied.
    pub fn arm_alerts(&mut self) {
        self.armed = true;
    }

    /// A new actionable ticket arrived. Fires the sink at most once per
    /// cooldown window, only for audience members, never before the first
    /// load. Returns whether the alert fired.
    pub fn notify_new_ticket(&mut self, now: WallClock, sink: &dyn AlertSink) -> bool {
        if !self.armed {
            debug!("ticket alert suppressed: initial load not complete");
            return false;
        }
        let audience = self
            .local
            .as_ref()
            .is_some_and(|user| user.role.hears_ticket_alerts());
        if !audience {
            return false;
        }
        if let Some(last) = self.last_alert
            && now.millis_since(last) < self.cooldown_ms
        {
            debug!("ticket alert suppressed: cooldown");
            return false;
        }
        self.last_alert = Some(now);
        sink.new_ticket_alert();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingSink {
        fired: Cell<u32>,
    }

    impl CountingSink {
        fn new() -> Self {
            Self { fired: Cell::new(0) }
        }
    }

    impl AlertSink for CountingSink {
        fn new_ticket_alert(&self) {
            self.fired.set(self.fired.get() + 1);
        }
    }

    fn user(id: &str, role: UserRole) -> PresenceUser {
        PresenceUser {
            id: UserId::new(id).unwrap(),
            role,
            team: Some("portaria".to_string()),
        }
    }

    fn operations_tracker() -> PresenceTracker {
        let mut tracker = PresenceTracker::new(30_000);
        tracker.set_local_session(Some(user("me", UserRole::Operations)));
        tracker
    }

    #[test]
    fn join_is_idempotent() {
        let mut tracker = operations_tracker();
        tracker.apply_join(user("u1", UserRole::Staff));
        tracker.apply_join(user("u1", UserRole::Staff));
        assert_eq!(tracker.online_count(), 1);
    }

    #[test]
    fn roster_replaces_wholesale() {
        let mut tracker = operations_tracker();
        tracker.apply_join(user("u1", UserRole::Staff));
        tracker.replace_roster(vec![user("u2", UserRole::Admin), user("u3", UserRole::Staff)]);
        assert!(!tracker.is_online(&UserId::new("u1").unwrap()));
        assert_eq!(tracker.online_count(), 2);
    }

    #[test]
    fn disconnect_clears_roster() {
        let mut tracker = operations_tracker();
        tracker.replace_roster(vec![user("u1", UserRole::Staff)]);
        tracker.on_disconnected();
        assert_eq!(tracker.online_count(), 0);
    }

    #[test]
    fn alert_suppressed_until_initial_load() {
        let mut tracker = operations_tracker();
        tracker.on_connected();
        let sink = CountingSink::new();

        assert!(!tracker.notify_new_ticket(WallClock(100), &sink));
        tracker.arm_alerts();
        assert!(tracker.notify_new_ticket(WallClock(200), &sink));
        assert_eq!(sink.fired.get(), 1);
    }

    #[test]
    fn cooldown_limits_alert_bursts() {
        let mut tracker = operations_tracker();
        tracker.arm_alerts();
        let sink = CountingSink::new();

        assert!(tracker.notify_new_ticket(WallClock(0), &sink));
        assert!(!tracker.notify_new_ticket(WallClock(1), &sink));
        assert!(!tracker.notify_new_ticket(WallClock(29_999), &sink));
        assert!(tracker.notify_new_ticket(WallClock(30_000), &sink));
        assert_eq!(sink.fired.get(), 2);
    }

    #[test]
    fn alert_requires_audience_membership() {
        let mut tracker = PresenceTracker::new(30_000);
        tracker.set_local_session(Some(user("me", UserRole::Staff)));
        tracker.arm_alerts();
        let sink = CountingSink::new();

        assert!(!tracker.notify_new_ticket(WallClock(0), &sink));
        assert_eq!(sink.fired.get(), 0);
    }

    #[test]
    fn reconnect_disarms_alerts_again() {
        let mut tracker = operations_tracker();
        tracker.arm_alerts();
        tracker.on_connected();
        let sink = CountingSink::new();
        assert!(!tracker.notify_new_ticket(WallClock(0), &sink));
    }
}
