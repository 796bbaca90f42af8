//! Monotonic, high-resolution time and per-link clock synchronization.
//!
//! `MapperTime` is a 64-bit-seconds + 64-bit-fraction fixed point value,
//! wide enough that truncating to the 32.32 NTP timetag carried in an OSC
//! bundle header loses only sub-nanosecond precision.

use std::time::{SystemTime, UNIX_EPOCH};

const FRAC_SCALE: f64 = 18_446_744_073_709_551_616.0; // 2^64

/// A point in time: whole seconds since the Unix epoch plus a fractional part.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapperTime {
    pub sec: u64,
    pub frac: u64,
}

impl MapperTime {
    pub const ZERO: MapperTime = MapperTime { sec: 0, frac: 0 };

    pub fn new(sec: u64, frac: u64) -> Self {
        Self { sec, frac }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_double(d.as_secs_f64())
    }

    pub fn from_double(t: f64) -> Self {
        if t <= 0.0 {
            return Self::ZERO;
        }
        let sec = t.trunc() as u64;
        let frac = (t.fract() * FRAC_SCALE) as u64;
        Self { sec, frac }
    }

    pub fn as_double(&self) -> f64 {
        self.sec as f64 + (self.frac as f64) / FRAC_SCALE
    }

    pub fn add(&self, other: &MapperTime) -> MapperTime {
        Self::from_double(self.as_double() + other.as_double())
    }

    pub fn sub(&self, other: &MapperTime) -> MapperTime {
        Self::from_double((self.as_double() - other.as_double()).max(0.0))
    }

    /// Signed difference in seconds, `self - other`.
    pub fn diff(&self, other: &MapperTime) -> f64 {
        self.as_double() - other.as_double()
    }

    pub fn mul(&self, scalar: f64) -> MapperTime {
        Self::from_double(self.as_double() * scalar)
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.frac == 0
    }
}

impl From<f64> for MapperTime {
    fn from(t: f64) -> Self {
        Self::from_double(t)
    }
}

/// Per-peer clock synchronization state, updated from ping round-trips
/// (spec §4.8). `offset` is added to a remote-reported time to translate it
/// into the local clock's frame; `latency` and `jitter` are one-way
/// estimates derived from round-trip samples.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncClock {
    pub offset: f64,
    pub latency: f64,
    pub jitter: f64,
    /// Monotonically increasing id of the last ping we sent.
    pub sent_msg_id: i32,
    /// Time each sent ping id was dispatched, used to compute round trip
    /// time once the peer's reply carries it back. Only the most recent
    /// outstanding id is tracked, matching the single in-flight ping the
    /// original protocol allows per peer.
    pub sent_time: MapperTime,
    /// Last ping id we have seen from the peer, or -1 if the peer has
    /// been marked tentatively expired (spec §4.8).
    pub last_seen_peer_msg_id: i32,
    pub have_sample: bool,
}

impl SyncClock {
    pub fn new() -> Self {
        Self {
            last_seen_peer_msg_id: -1,
            ..Default::default()
        }
    }

    /// Record a round trip sample derived from a `/ping` reply.
    ///
    /// `elapsed_total` is `now - sent_time[msg_id]` measured by us;
    /// `peer_reported_elapsed` is the time the peer claims it held the
    /// ping before replying (processing latency on their side);
    /// `bundle_timestamp` is the NTP timestamp of the bundle the reply
    /// arrived in, and `now` is our receipt time.
    pub fn record_ping_reply(
        &mut self,
        now: MapperTime,
        elapsed_total: f64,
        peer_reported_elapsed: f64,
        bundle_timestamp: MapperTime,
    ) {
        let one_way_latency = (elapsed_total - peer_reported_elapsed) / 2.0;
        let new_offset = now.diff(&bundle_timestamp) - one_way_latency;
        let new_latency = one_way_latency;

        if !self.have_sample {
            self.offset = new_offset;
            self.latency = new_latency;
            self.jitter = 0.0;
            self.have_sample = true;
            return;
        }

        self.jitter = 0.9 * self.jitter + 0.1 * (self.latency - new_latency).abs();

        if new_offset > self.offset {
            // Remote clock is ahead of our estimate: adopt immediately.
            self.offset = new_offset;
            self.latency = new_latency;
        } else if (new_latency - self.latency).abs() <= self.jitter {
            self.offset = 0.9 * self.offset + 0.1 * new_offset;
            self.latency = 0.9 * self.latency + 0.1 * new_latency;
        }
    }

    /// Mark the peer tentatively expired: no ping seen for `TIMEOUT_SEC`.
    pub fn mark_tentatively_expired(&mut self) {
        self.last_seen_peer_msg_id = -1;
    }

    pub fn is_tentatively_expired(&self) -> bool {
        self.last_seen_peer_msg_id == -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_roundtrip_is_close() {
        let t = MapperTime::from_double(1234.5);
        assert!((t.as_double() - 1234.5).abs() < 1e-9);
    }

    #[test]
    fn add_sub_are_inverses() {
        let a = MapperTime::from_double(10.25);
        let b = MapperTime::from_double(3.5);
        let sum = a.add(&b);
        let back = sum.sub(&b);
        assert!((back.as_double() - a.as_double()).abs() < 1e-9);
    }

    #[test]
    fn diff_is_signed() {
        let a = MapperTime::from_double(5.0);
        let b = MapperTime::from_double(2.0);
        assert!((a.diff(&b) - 3.0).abs() < 1e-9);
        assert!((b.diff(&a) + 3.0).abs() < 1e-9);
    }

    #[test]
    fn first_ping_sample_sets_values_directly() {
        let mut clock = SyncClock::new();
        let now = MapperTime::from_double(100.0);
        let bundle_ts = MapperTime::from_double(99.95);
        clock.record_ping_reply(now, 0.1, 0.0, bundle_ts);
        assert!(clock.have_sample);
        assert_eq!(clock.jitter, 0.0);
    }
}
