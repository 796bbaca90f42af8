//! Link: the bidirectional channel between two devices (spec §3, §4.8).

use mapper_core::object::ObjectId;
use mapper_core::time::{MapperTime, SyncClock};
use rosc::OscMessage;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct LinkAddresses {
    /// Mesh (admin) address, used for map handshakes.
    pub admin: Option<SocketAddr>,
    pub udp_data: Option<SocketAddr>,
    pub tcp_data: Option<SocketAddr>,
}

/// Accumulates outbound OSC messages for one destination between `poll`
/// calls, flushing once the estimated wire size would exceed the bundle
/// threshold (spec §4.1).
#[derive(Debug)]
pub struct BundleQueue {
    messages: Vec<OscMessage>,
    approx_size: usize,
    threshold: usize,
}

fn estimate_size(msg: &OscMessage) -> usize {
    // Address string, a rounded-up type-tag block, and 4/8 bytes per atom:
    // good enough to trigger flushes at roughly the real wire size without
    // fully serializing every queued message up front.
    16 + msg.addr.len() + msg.args.len() * 8
}

impl BundleQueue {
    pub fn new(threshold: usize) -> Self {
        Self {
            messages: Vec::new(),
            approx_size: 0,
            threshold: threshold.max(1),
        }
    }

    /// Queue `msg`; returns the previously queued messages (to flush) if
    /// adding it would exceed the threshold, leaving `msg` as the start of
    /// the next bundle.
    pub fn push(&mut self, msg: OscMessage) -> Option<Vec<OscMessage>> {
        let size = estimate_size(&msg);
        if self.approx_size + size > self.threshold && !self.messages.is_empty() {
            let flushed = std::mem::take(&mut self.messages);
            self.approx_size = size;
            self.messages.push(msg);
            return Some(flushed);
        }
        self.approx_size += size;
        self.messages.push(msg);
        None
    }

    /// Take whatever is queued (a destination-less flush is a no-op if
    /// empty, per spec §4.1).
    pub fn take(&mut self) -> Option<Vec<OscMessage>> {
        if self.messages.is_empty() {
            return None;
        }
        self.approx_size = 0;
        Some(std::mem::take(&mut self.messages))
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkTimeoutState {
    Alive,
    TentativelyExpired,
    Expired,
}

pub struct Link {
    pub id: ObjectId,
    pub device_a: ObjectId,
    pub device_b: ObjectId,
    pub addresses: LinkAddresses,
    /// `[a_to_b, b_to_a]` active map counts (spec §3 invariant 7).
    pub num_maps: [u32; 2],
    pub clock: SyncClock,
    pub last_ping_received: Option<MapperTime>,
    pub tentatively_expired_since: Option<MapperTime>,
    pub bundle: BundleQueue,
}

impl Link {
    pub fn new(id: ObjectId, device_a: ObjectId, device_b: ObjectId, bundle_threshold: usize) -> Self {
        Self {
            id,
            device_a,
            device_b,
            addresses: LinkAddresses::default(),
            num_maps: [0, 0],
            clock: SyncClock::new(),
            last_ping_received: None,
            tentatively_expired_since: None,
            bundle: BundleQueue::new(bundle_threshold),
        }
    }

    pub fn note_ping_received(&mut self, now: MapperTime) {
        self.last_ping_received = Some(now);
        self.tentatively_expired_since = None;
    }

    /// Spec §4.8: tentatively expire after `timeout` of silence; fully
    /// expire after another `timeout` beyond that.
    pub fn check_timeout(&mut self, now: MapperTime, timeout: Duration) -> LinkTimeoutState {
        let Some(last) = self.last_ping_received else {
            return LinkTimeoutState::Alive;
        };
        let elapsed = now.diff(&last);
        let t = timeout.as_secs_f64();
        if elapsed > 2.0 * t {
            LinkTimeoutState::Expired
        } else if elapsed > t {
            if self.tentatively_expired_since.is_none() {
                self.tentatively_expired_since = Some(now);
            }
            LinkTimeoutState::TentativelyExpired
        } else {
            LinkTimeoutState::Alive
        }
    }

    pub fn total_maps(&self) -> u32 {
        self.num_maps[0] + self.num_maps[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(addr: &str, n_args: usize) -> OscMessage {
        OscMessage {
            addr: addr.to_string(),
            args: vec![rosc::OscType::Int(0); n_args],
        }
    }

    #[test]
    fn bundle_flushes_when_threshold_exceeded() {
        let mut q = BundleQueue::new(64);
        assert!(q.push(msg("/a", 2)).is_none());
        let flushed = q.push(msg("/b", 20));
        assert!(flushed.is_some());
        assert_eq!(flushed.unwrap().len(), 1);
    }

    #[test]
    fn take_is_noop_when_empty() {
        let mut q = BundleQueue::new(1024);
        assert!(q.take().is_none());
    }

    #[test]
    fn timeout_progresses_alive_to_tentative_to_expired() {
        let mut l = Link::new(1, 10, 20, 8192);
        let t0 = MapperTime::from_double(0.0);
        l.note_ping_received(t0);
        assert_eq!(l.check_timeout(MapperTime::from_double(5.0), Duration::from_secs(10)), LinkTimeoutState::Alive);
        assert_eq!(
            l.check_timeout(MapperTime::from_double(15.0), Duration::from_secs(10)),
            LinkTimeoutState::TentativelyExpired
        );
        assert_eq!(
            l.check_timeout(MapperTime::from_double(25.0), Duration::from_secs(10)),
            LinkTimeoutState::Expired
        );
    }
}
