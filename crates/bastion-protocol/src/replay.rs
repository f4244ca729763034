//! Replay protection via seen-timestamp windows.
//!
//! Each channel (a requester, a session) keeps the set of protocol
//! timestamps it has accepted. The cache rejects:
//! - Any timestamp already seen on the channel
//! - Any timestamp older than the window
//! - Any timestamp further in the future than the allowed skew
//!
//! Entries older than the window are evicted on every check, so memory stays
//! bounded by the request rate times the window.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::constants::{DEFAULT_MAX_CLOCK_SKEW_SECS, DEFAULT_REPLAY_WINDOW_SECS};
use crate::errors::{ProtocolError, ProtocolResult};
use crate::timestamp::Timestamp;

/// Sliding-window replay cache partitioned by channel
pub struct ReplayCache {
    window: Duration,
    max_skew: Duration,
    channels: Mutex<HashMap<String, BTreeSet<Timestamp>>>,
}

impl ReplayCache {
    pub fn new(window: Duration, max_skew: Duration) -> Self {
        Self {
            window,
            max_skew,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Accept `timestamp` on `channel` exactly once
    pub fn check_and_record(&self, channel: &str, timestamp: Timestamp) -> ProtocolResult<()> {
        self.check_and_record_at(channel, timestamp, Timestamp::now())
    }

    /// Same as [`check_and_record`](Self::check_and_record) with an explicit clock
    pub fn check_and_record_at(
        &self,
        channel: &str,
        timestamp: Timestamp,
        now: Timestamp,
    ) -> ProtocolResult<()> {
        let oldest = now.saturating_sub(self.window);
        if timestamp < oldest {
            return Err(ProtocolError::ReplayAttack(format!(
                "timestamp {timestamp} on {channel} is older than the replay window"
            )));
        }
        if timestamp > now.saturating_add(self.max_skew) {
            return Err(ProtocolError::ReplayAttack(format!(
                "timestamp {timestamp} on {channel} is too far in the future"
            )));
        }

        // Check and insert under one lock so concurrent duplicates cannot both pass
        let mut channels = self.channels.lock();
        let seen = channels.entry(channel.to_string()).or_default();
        *seen = seen.split_off(&oldest);
        if !seen.insert(timestamp) {
            return Err(ProtocolError::ReplayAttack(format!(
                "timestamp {timestamp} already used on {channel}"
            )));
        }
        Ok(())
    }

    /// Drop a channel, e.g. when its session ends
    pub fn forget(&self, channel: &str) {
        self.channels.lock().remove(channel);
    }

    /// Evict aged-out entries and empty channels
    pub fn sweep(&self) -> usize {
        let oldest = Timestamp::now().saturating_sub(self.window);
        let mut channels = self.channels.lock();
        let mut evicted = 0;
        channels.retain(|_, seen| {
            let before = seen.len();
            *seen = seen.split_off(&oldest);
            evicted += before - seen.len();
            !seen.is_empty()
        });
        evicted
    }

    /// Number of tracked timestamps across all channels
    pub fn len(&self) -> usize {
        self.channels.lock().values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_REPLAY_WINDOW_SECS),
            Duration::from_secs(DEFAULT_MAX_CLOCK_SKEW_SECS),
        )
    }
}
