//! Liveness probing for connected sessions
//!
//! Each tracked session starts alive with a miss counter of zero. Every
//! probe interval the counter is incremented and a heartbeat is sent; any
//! inbound packet from the session resets it. A session whose counter reaches
//! the miss threshold is dead and is dropped from tracking, so it is reported
//! exactly once.

use log::debug;
use shared::SessionId;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive { misses: u32 },
    Dead,
}

/// What one probe interval produced
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeartbeatTick {
    /// Sessions that should receive a heartbeat now
    pub probe: Vec<SessionId>,
    /// Sessions that just crossed the miss threshold
    pub expired: Vec<SessionId>,
}

pub struct HeartbeatMonitor {
    interval: Duration,
    miss_threshold: u32,
    misses: HashMap<SessionId, u32>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, miss_threshold: u32) -> Self {
        Self {
            interval,
            miss_threshold: miss_threshold.max(1),
            misses: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn miss_threshold(&self) -> u32 {
        self.miss_threshold
    }

    /// Starts tracking a newly created session
    pub fn track(&mut self, session: SessionId) {
        self.misses.insert(session, 0);
    }

    /// Stops tracking a released session; returns whether it was tracked
    pub fn untrack(&mut self, session: SessionId) -> bool {
        self.misses.remove(&session).is_some()
    }

    /// Resets the miss counter after inbound traffic
    pub fn record_activity(&mut self, session: SessionId) {
        if let Some(misses) = self.misses.get_mut(&session) {
            *misses = 0;
        }
    }

    /// Untracked sessions, including expired ones, report `Dead`.
    pub fn liveness(&self, session: SessionId) -> Liveness {
        match self.misses.get(&session) {
            Some(&misses) => Liveness::Alive { misses },
            None => Liveness::Dead,
        }
    }

    pub fn tracked(&self) -> usize {
        self.misses.len()
    }

    /// Advances every session by one probe interval
    pub fn tick(&mut self) -> HeartbeatTick {
        let mut outcome = HeartbeatTick::default();

        for (&session, misses) in self.misses.iter_mut() {
            *misses += 1;
            if *misses >= self.miss_threshold {
                outcome.expired.push(session);
            } else {
                outcome.probe.push(session);
            }
        }

        for session in &outcome.expired {
            self.misses.remove(session);
            debug!(
                "Session {} missed {} heartbeats",
                session, self.miss_threshold
            );
        }

        outcome.probe.sort_unstable();
        outcome.expired.sort_unstable();
        outcome
    }
}
