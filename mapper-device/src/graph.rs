//! Graph: the process-wide registry of objects learned from the bus (spec
//! §3 "Graph" entity, §4.3 Subscription).

use mapper_core::object::ObjectId;
use mapper_core::property::PropertyTable;
use mapper_core::time::MapperTime;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::link::Link;

/// A remote device's learned metadata (name, properties, last `/sync`
/// version seen) — distinct from the locally-owned `Device` in
/// `device.rs`.
#[derive(Clone, Debug)]
pub struct DeviceRecord {
    pub id: ObjectId,
    pub name: String,
    pub props: PropertyTable,
    pub last_sync_version: i32,
}

/// Subscriber interest bitmask (spec §4.3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscribeFlags(pub u16);

impl SubscribeFlags {
    pub const DEVICE: SubscribeFlags = SubscribeFlags(0b0000_0001);
    pub const SIGNALS: SubscribeFlags = SubscribeFlags(0b0000_0010);
    pub const INPUTS: SubscribeFlags = SubscribeFlags(0b0000_0100);
    pub const OUTPUTS: SubscribeFlags = SubscribeFlags(0b0000_1000);
    pub const MAPS: SubscribeFlags = SubscribeFlags(0b0001_0000);
    pub const MAPS_IN: SubscribeFlags = SubscribeFlags(0b0010_0000);
    pub const MAPS_OUT: SubscribeFlags = SubscribeFlags(0b0100_0000);
    pub const ALL: SubscribeFlags = SubscribeFlags(0b0111_1111);

    pub fn from_str_list(flags: &[&str]) -> SubscribeFlags {
        let mut v = 0u16;
        for f in flags {
            v |= match *f {
                "device" => Self::DEVICE.0,
                "signals" => Self::SIGNALS.0,
                "inputs" => Self::INPUTS.0,
                "outputs" => Self::OUTPUTS.0,
                "maps" => Self::MAPS.0,
                "maps_in" => Self::MAPS_IN.0,
                "maps_out" => Self::MAPS_OUT.0,
                "all" => Self::ALL.0,
                _ => 0,
            };
        }
        SubscribeFlags(v)
    }

    pub fn contains(&self, other: SubscribeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(&self, other: SubscribeFlags) -> SubscribeFlags {
        SubscribeFlags(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Clone, Debug)]
pub struct Subscription {
    pub addr: SocketAddr,
    pub flags: SubscribeFlags,
    pub lease_exp: MapperTime,
}

#[derive(Default)]
pub struct Graph {
    pub devices: HashMap<ObjectId, DeviceRecord>,
    pub links: HashMap<ObjectId, Link>,
    pub subscriptions: Vec<Subscription>,
    pub autosubscribe: Option<SubscribeFlags>,
    next_link_id: ObjectId,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_device(&mut self, id: ObjectId, name: impl Into<String>) -> &mut DeviceRecord {
        self.devices.entry(id).or_insert_with(|| DeviceRecord {
            id,
            name: name.into(),
            props: PropertyTable::new(),
            last_sync_version: -1,
        })
    }

    pub fn remove_device(&mut self, id: ObjectId) -> Option<DeviceRecord> {
        self.devices.remove(&id)
    }

    pub fn find_link(&self, a: ObjectId, b: ObjectId) -> Option<&Link> {
        self.links
            .values()
            .find(|l| (l.device_a == a && l.device_b == b) || (l.device_a == b && l.device_b == a))
    }

    pub fn find_or_create_link(&mut self, a: ObjectId, b: ObjectId, bundle_threshold: usize) -> ObjectId {
        if let Some(l) = self.find_link(a, b) {
            return l.id;
        }
        self.next_link_id += 1;
        let id = self.next_link_id;
        self.links.insert(id, Link::new(id, a, b, bundle_threshold));
        id
    }

    pub fn check_link_timeouts(&mut self, now: MapperTime, timeout: Duration) -> Vec<ObjectId> {
        let mut expired = Vec::new();
        for link in self.links.values_mut() {
            if link.check_timeout(now, timeout) == crate::link::LinkTimeoutState::Expired {
                expired.push(link.id);
            }
        }
        for id in &expired {
            self.links.remove(id);
        }
        expired
    }

    /// `/<dev>/subscribe` handling (spec §4.3): zero-lease unsubscribes;
    /// otherwise flags union and the lease is (re)set from `now`.
    pub fn subscribe(&mut self, addr: SocketAddr, flags: SubscribeFlags, lease_secs: f64, now: MapperTime) {
        if let Some(pos) = self.subscriptions.iter().position(|s| s.addr == addr) {
            if lease_secs <= 0.0 {
                self.subscriptions.remove(pos);
                return;
            }
            let existing = &mut self.subscriptions[pos];
            existing.flags = existing.flags.union(flags);
            existing.lease_exp = now.add(&MapperTime::from_double(lease_secs));
            return;
        }
        if lease_secs <= 0.0 {
            return;
        }
        self.subscriptions.push(Subscription {
            addr,
            flags,
            lease_exp: now.add(&MapperTime::from_double(lease_secs)),
        });
    }

    pub fn prune_expired_subscriptions(&mut self, now: MapperTime) {
        self.subscriptions.retain(|s| s.lease_exp.diff(&now) > 0.0);
    }

    pub fn subscribers_matching(&self, flags: SubscribeFlags) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter().filter(move |s| s.flags.contains(flags) || s.flags.contains(SubscribeFlags::ALL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn zero_lease_unsubscribes() {
        let mut g = Graph::new();
        let a = addr(9000);
        g.subscribe(a, SubscribeFlags::DEVICE, 10.0, MapperTime::ZERO);
        assert_eq!(g.subscriptions.len(), 1);
        g.subscribe(a, SubscribeFlags::DEVICE, 0.0, MapperTime::ZERO);
        assert!(g.subscriptions.is_empty());
    }

    #[test]
    fn repeated_subscribe_unions_flags() {
        let mut g = Graph::new();
        let a = addr(9000);
        g.subscribe(a, SubscribeFlags::DEVICE, 10.0, MapperTime::ZERO);
        g.subscribe(a, SubscribeFlags::SIGNALS, 10.0, MapperTime::ZERO);
        assert!(g.subscriptions[0].flags.contains(SubscribeFlags::DEVICE));
        assert!(g.subscriptions[0].flags.contains(SubscribeFlags::SIGNALS));
    }

    #[test]
    fn expired_subscriptions_are_pruned() {
        let mut g = Graph::new();
        g.subscribe(addr(9000), SubscribeFlags::DEVICE, 1.0, MapperTime::from_double(0.0));
        g.prune_expired_subscriptions(MapperTime::from_double(5.0));
        assert!(g.subscriptions.is_empty());
    }

    #[test]
    fn find_or_create_link_is_idempotent() {
        let mut g = Graph::new();
        let id1 = g.find_or_create_link(1, 2, 8192);
        let id2 = g.find_or_create_link(2, 1, 8192);
        assert_eq!(id1, id2);
    }
}
