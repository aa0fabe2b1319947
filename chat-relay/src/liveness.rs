use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

use crate::{
    registry::Registry,
    session::{Liveness, Session, SessionId},
};

/// Heartbeat for sessions whose transport cannot notice a vanished peer.
///
/// Every tick first evicts the sessions that left the previous probe
/// unanswered, then marks the rest unconfirmed and probes them again. A peer
/// therefore has one full interval to answer.
#[derive(Debug, Clone, Copy)]
pub struct LivenessMonitor {
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Ticker for the relay loop; the first tick fires one interval from now.
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Runs one heartbeat round and returns the evicted sessions.
    pub fn sweep(&self, registry: &mut Registry) -> Vec<Session> {
        let stale: Vec<SessionId> = registry
            .all()
            .filter(|session| session.liveness() == Liveness::Unconfirmed)
            .map(Session::id)
            .collect();

        let evicted = stale
            .into_iter()
            .filter_map(|id| {
                if let Some(session) = registry.get_mut(id) {
                    session.close();
                }
                registry.remove(id)
            })
            .collect();

        for session in registry.all_mut() {
            session.probe();
        }

        evicted
    }

    /// Records a probe answer.
    pub fn acknowledge(&self, registry: &mut Registry, id: SessionId) {
        if let Some(session) = registry.get_mut(id) {
            session.confirm();
        }
    }
}
