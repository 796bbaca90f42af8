//! Device: the local aggregate — name allocation, signal table, router,
//! graph, and the poll loop that drives them all (spec §4.2, §4.10).

use anyhow::Context;
use mapper_core::atom::{self, AtomOp, Scope as AtomScope};
use mapper_core::error::MapperError;
use mapper_core::idmap::{self, Gid, Lid};
use mapper_core::map::{Map, Mode};
use mapper_core::object::{self, ObjectId};
use mapper_core::property::{Prop, PropFlags, PropValue, PropertyTable};
use mapper_core::router::Router;
use mapper_core::signal::{Direction, Signal};
use mapper_core::slot::{Slot, SlotDirection};
use mapper_core::time::MapperTime;
use mapper_core::value::{Elem, ScalarType};
use rand::Rng;
use rosc::{OscMessage, OscType};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::config::DeviceConfig;
use crate::graph::{Graph, SubscribeFlags};
use crate::link::LinkTimeoutState;
use crate::network::{self, HandlerTable, Ticker};

/// Name-allocation phase (spec §4.2): probe the requested `name.<ordinal>`
/// on the bus, count collisions, then lock in the lowest free ordinal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NameState {
    Probing,
    Registered,
}

struct NameAllocator {
    base_name: String,
    ordinal: u32,
    state: NameState,
    probe_deadline: MapperTime,
    collisions: u32,
}

/// The local device: signals, its router, its view of the graph, and the
/// sockets it polls (spec §3 "Device", §4.10 "Poll loop").
pub struct Device {
    pub config: DeviceConfig,
    name_alloc: NameAllocator,
    pub id: ObjectId,
    pub props: PropertyTable,
    pub signals: HashMap<ObjectId, Signal>,
    signal_names: HashMap<String, ObjectId>,
    next_signal_ordinal: u32,
    next_map_ordinal: u32,
    pub router: Router,
    pub graph: Graph,
    bus: UdpSocket,
    mesh: UdpSocket,
    ticker: Ticker,
    started_at: MapperTime,
}

impl Device {
    pub fn new(requested_name: impl Into<String>, config: DeviceConfig) -> std::io::Result<Self> {
        let iface = config.interface.as_deref().and_then(|s| s.parse().ok());
        let bus = network::bind_bus(config.multicast_group, config.multicast_port, iface)?;
        let mesh = network::bind_unicast()?;
        Ok(Self {
            name_alloc: NameAllocator {
                base_name: requested_name.into(),
                ordinal: 0,
                state: NameState::Probing,
                probe_deadline: MapperTime::ZERO,
                collisions: 0,
            },
            id: 0,
            props: PropertyTable::new(),
            signals: HashMap::new(),
            signal_names: HashMap::new(),
            next_signal_ordinal: 0,
            next_map_ordinal: 0,
            router: Router::new(),
            graph: Graph::new(),
            bus,
            mesh,
            ticker: Ticker::new(config.default_subscriber_lease.unwrap_or(Duration::from_secs(2)), Duration::from_secs(5)),
            started_at: MapperTime::now(),
            config,
        })
    }

    pub fn is_registered(&self) -> bool {
        self.name_alloc.state == NameState::Registered
    }

    pub fn ordinal_name(&self) -> String {
        format!("{}.{}", self.name_alloc.base_name, self.name_alloc.ordinal)
    }

    /// Kick off (or retry) the probe for the current ordinal (spec §4.2).
    fn send_probe(&mut self, now: MapperTime) {
        let name = self.ordinal_name();
        self.name_alloc.probe_deadline = now.add(&MapperTime::from_double(0.5));
        tracing::debug!(name = %name, "probing for name");
        let result = network::send_message(
            &self.bus,
            bus_addr(&self.config),
            OscMessage {
                addr: "/name/probe".to_string(),
                args: vec![OscType::String(name)],
            },
        )
        .context("failed to send /name/probe");
        if let Err(e) = result {
            tracing::warn!(error = %e, "probe send failed");
        }
    }

    /// A `/name/probe` collision from a peer bumps our ordinal and resets
    /// the probe timer (spec §4.2 "hints bitmap" simplified to a linear
    /// scan, since collision volume on a LAN discovery bus is small). The
    /// bump is a small random step rather than always `+1` so that two
    /// devices racing for the same ordinal don't leapfrog each other onto
    /// the same next guess.
    fn on_probe_collision(&mut self, probed_name: &str, now: MapperTime) {
        if self.name_alloc.state != NameState::Probing || probed_name != self.ordinal_name() {
            return;
        }
        self.name_alloc.collisions += 1;
        self.name_alloc.ordinal += rand::thread_rng().gen_range(1..=3);
        tracing::debug!(
            collisions = self.name_alloc.collisions,
            new_ordinal = self.name_alloc.ordinal,
            "name probe collision, bumping ordinal"
        );
        self.send_probe(now);
    }

    /// Send the first probe for the current ordinal, if none has gone out
    /// yet (spec §4.2: a device must not self-register before giving peers
    /// a chance to object).
    fn ensure_probing(&mut self, now: MapperTime) {
        if self.name_alloc.state == NameState::Probing && self.name_alloc.probe_deadline.is_zero() {
            self.send_probe(now);
        }
    }

    /// No collision heard by the deadline: lock the ordinal and announce
    /// (spec §4.2 "Registered").
    fn maybe_finish_registration(&mut self, now: MapperTime) {
        if self.name_alloc.state != NameState::Probing {
            return;
        }
        if now.diff(&self.name_alloc.probe_deadline) < 0.0 {
            return;
        }
        self.name_alloc.state = NameState::Registered;
        self.id = object::device_id_from_name(&self.ordinal_name());
        self.props.set(Prop::Name, PropValue::Str(self.ordinal_name()), PropFlags::NON_MODIFIABLE);
        self.props.set(Prop::Id, PropValue::I32(self.id as i32), PropFlags::NON_MODIFIABLE);
        tracing::info!(name = %self.ordinal_name(), id = self.id, "name registered");
        let result = network::send_message(
            &self.bus,
            bus_addr(&self.config),
            OscMessage {
                addr: "/name/registered".to_string(),
                args: vec![OscType::String(self.ordinal_name())],
            },
        )
        .context("failed to send /name/registered");
        if let Err(e) = result {
            tracing::warn!(error = %e, "registration announcement send failed");
        }
    }

    /// Add a locally owned signal (spec §4.4 "creation"), assigning it a
    /// per-device ordinal id.
    #[allow(clippy::too_many_arguments)]
    pub fn add_signal(
        &mut self,
        name: impl Into<String>,
        direction: Direction,
        scalar_type: ScalarType,
        length: usize,
        num_inst: usize,
    ) -> ObjectId {
        let name = name.into();
        let ordinal = self.next_signal_ordinal;
        self.next_signal_ordinal += 1;
        let id = object::child_id(self.id, ordinal);
        let sig = Signal::new(id, self.id, name.clone(), direction, scalar_type, length, num_inst);
        self.signal_names.insert(name, id);
        self.signals.insert(id, sig);
        id
    }

    pub fn signal_by_name(&self, name: &str) -> Option<&Signal> {
        self.signal_names.get(name).and_then(|id| self.signals.get(id))
    }

    /// Local write path (spec §4.4 `set_value` + §4.7 `process_sig`): update
    /// the instance, then fan the value out through the router.
    pub fn update_signal(&mut self, signal_id: ObjectId, lid: Lid, values: &[Elem], now: MapperTime) -> Result<(), MapperError> {
        let sig = self.signals.get_mut(&signal_id).ok_or_else(|| MapperError::UnknownTarget(signal_id.to_string()))?;
        sig.set_value(lid, values, now)?;
        let updates = self.router.process_outgoing(signal_id, lid, values, self.id, now);
        self.dispatch_routed(updates, now);
        Ok(())
    }

    pub fn release_instance(&mut self, signal_id: ObjectId, lid: Lid, now: MapperTime) {
        if let Some(sig) = self.signals.get_mut(&signal_id) {
            sig.release(lid, now);
        }
        let nulls = self
            .signals
            .get(&signal_id)
            .map(|s| vec![Elem::Null; s.length])
            .unwrap_or_default();
        let updates = self.router.process_outgoing(signal_id, lid, &nulls, self.id, now);
        self.dispatch_routed(updates, now);
    }

    fn dispatch_routed(&mut self, updates: Vec<mapper_core::router::RoutedUpdate>, now: MapperTime) {
        for u in updates {
            if u.muted {
                continue;
            }
            if let Some(local) = self.signals.get_mut(&u.dest_signal_id) {
                if u.release_before {
                    local.release(u.lid, now);
                }
                if let Some(v) = &u.value {
                    if let Err(e) = local.set_value(u.lid, v, now) {
                        tracing::warn!(map_id = u.map_id, error = %e, "failed to apply routed update");
                    }
                }
                if u.release_after {
                    local.release(u.lid, now);
                }
                continue;
            }
            // Remote destination: forward over the mesh (spec §4.6 wire
            // encoding — an all-null payload is a release).
            if let Some(link) = self.graph.find_link(self.id, other_device_of(&u.dest_signal_id)) {
                if let Some(addr) = link.addresses.udp_data {
                    let args: Vec<OscType> = match &u.value {
                        Some(v) => v.iter().map(elem_to_osc).collect(),
                        None => vec![OscType::Nil],
                    };
                    let result = network::send_message(&self.mesh, addr, OscMessage { addr: format!("/{:x}", u.dest_signal_id), args })
                        .context("failed to forward routed update over mesh");
                    if let Err(e) = result {
                        tracing::warn!(map_id = u.map_id, dest = %addr, error = %e, "routed update send failed");
                    }
                }
            }
        }
    }

    /// Register a map from a `/map` request naming this device as the
    /// destination (spec §4.5). Sources not yet type/length known keep the
    /// map at `Staged` until `/mapTo` fills in the remaining slot metadata.
    pub fn add_map(
        &mut self,
        sources: Vec<(ObjectId, ObjectId, ScalarType, usize)>,
        dest_signal: ObjectId,
        expr_str: Option<String>,
        mode: Mode,
    ) -> Result<ObjectId, MapperError> {
        let map_id = object::child_id(self.id, self.next_map_ordinal);
        self.next_map_ordinal += 1;

        let mut src_slots = Vec::new();
        for (i, (src_device, src_signal, ty, len)) in sources.into_iter().enumerate() {
            let mut slot = Slot::new(i as u32, src_signal, src_device, SlotDirection::Src);
            slot.lock_type_length(ty, len);
            slot.link_known = src_device == self.id;
            src_slots.push(slot);
        }

        let dst_sig = self.signals.get(&dest_signal).ok_or_else(|| MapperError::UnknownTarget(dest_signal.to_string()))?;
        let mut dst_slot = Slot::new(0, dest_signal, self.id, SlotDirection::Dst);
        dst_slot.lock_type_length(dst_sig.scalar_type, dst_sig.length);
        dst_slot.link_known = true;

        let mut map = Map::new(map_id, src_slots, dst_slot);
        map.mode = mode;
        map.compile_expression(expr_str, true)?;
        map.refresh_status();
        let active = map.activate();
        tracing::info!(map_id, active, mode = ?map.mode, "map negotiated");

        self.router.add_map(map)
    }

    /// `/<dev>/subscribe` handling (spec §4.3).
    pub fn handle_subscribe(&mut self, from: SocketAddr, flag_strs: &[&str], lease_secs: f64, now: MapperTime) {
        let flags = SubscribeFlags::from_str_list(flag_strs);
        tracing::debug!(from = %from, lease_secs, "subscriber registered");
        self.graph.subscribe(from, flags, lease_secs, now);
    }

    /// `/<dev>/modify` and `/<sig>/modify` atom application (spec §4.9).
    pub fn apply_property_atoms(&mut self, target: ObjectId, atoms_raw: &[OscType]) {
        let atoms = atom::parse_atoms(atoms_raw);
        let Some(sig) = self.signals.get_mut(&target) else { return };
        for a in atoms {
            if a.scope != AtomScope::None || a.op != AtomOp::Set {
                continue;
            }
            if let Some(v) = atom::atom_to_prop_value(&a.raw) {
                sig.header.props.set(a.prop, v, PropFlags::NONE);
            }
        }
    }

    /// One iteration of the poll loop (spec §4.10): drain both sockets up
    /// to a bounded budget, run housekeeping on the configured cadence, and
    /// flush any bundled outbound traffic queued on links.
    pub fn poll(&mut self, recv_budget: usize) -> usize {
        let now = MapperTime::now();
        self.ensure_probing(now);
        self.maybe_finish_registration(now);

        let mut handled = 0;
        for _ in 0..recv_budget {
            let mut any = false;
            if let Some((pkt, from)) = network::recv_noblock(&self.bus) {
                self.handle_packet(pkt, from, now);
                any = true;
            }
            if let Some((pkt, from)) = network::recv_noblock(&self.mesh) {
                self.handle_packet(pkt, from, now);
                any = true;
            }
            if !any {
                break;
            }
            handled += 1;
        }

        if self.ticker.ping_due(now) {
            self.send_pings(now);
        }
        if self.ticker.sync_due(now) {
            self.housekeeping(now);
        }
        self.flush_link_bundles(now);
        handled
    }

    fn handle_packet(&mut self, pkt: rosc::OscPacket, from: SocketAddr, now: MapperTime) {
        match pkt {
            rosc::OscPacket::Message(msg) => self.handle_message(&msg, from, now),
            rosc::OscPacket::Bundle(b) => {
                for inner in b.content {
                    self.handle_packet(inner, from, now);
                }
            }
        }
    }

    fn handle_message(&mut self, msg: &OscMessage, from: SocketAddr, now: MapperTime) {
        match msg.addr.as_str() {
            "/name/probe" => {
                if let Some(OscType::String(name)) = msg.args.first() {
                    self.on_probe_collision(name, now);
                }
            }
            "/name/registered" => {
                if let Some(OscType::String(name)) = msg.args.first() {
                    let id = object::device_id_from_name(name);
                    if id != self.id {
                        self.graph.upsert_device(id, name.clone());
                    }
                }
            }
            "/ping" => {
                if let Some(link) = self.graph.links.values_mut().find(|l| l.addresses.admin == Some(from)) {
                    link.note_ping_received(now);
                }
            }
            "/logout" => {
                if let Some(OscType::String(name)) = msg.args.first() {
                    let id = object::device_id_from_name(name);
                    self.graph.remove_device(id);
                }
            }
            path if path.ends_with("/subscribe") => {
                let flags: Vec<&str> = msg
                    .args
                    .iter()
                    .filter_map(|a| if let OscType::String(s) = a { Some(s.as_str()) } else { None })
                    .collect();
                self.handle_subscribe(from, &flags, self.config.default_subscriber_lease.map(|d| d.as_secs_f64()).unwrap_or(60.0), now);
            }
            _ => {
                // Data path: `/<sig>` addressed by hex signal id (spec §6.2).
                if let Some(hex) = msg.addr.strip_prefix('/') {
                    if let Ok(signal_id) = ObjectId::from_str_radix(hex, 16) {
                        if self.signals.contains_key(&signal_id) {
                            self.handle_incoming_data(signal_id, msg, now);
                        }
                    }
                }
            }
        }
    }

    fn handle_incoming_data(&mut self, signal_id: ObjectId, msg: &OscMessage, now: MapperTime) {
        let values: Vec<Elem> = msg.args.iter().map(atom::osc_to_elem).collect();
        let lid: Lid = 0;
        let updates = self.router.process_incoming(signal_id, None, lid, &values, now);
        self.dispatch_routed(updates, now);
    }

    fn send_pings(&mut self, now: MapperTime) {
        let ids: Vec<ObjectId> = self.graph.links.keys().copied().collect();
        for id in ids {
            let Some(link) = self.graph.links.get_mut(&id) else { continue };
            link.clock.sent_msg_id += 1;
            link.clock.sent_time = now;
            if let Some(addr) = link.addresses.admin {
                let result = network::send_message(
                    &self.mesh,
                    addr,
                    OscMessage {
                        addr: "/ping".to_string(),
                        args: vec![OscType::Int(link.clock.sent_msg_id)],
                    },
                )
                .context("failed to send /ping");
                if let Err(e) = result {
                    tracing::warn!(link_id = id, error = %e, "ping send failed");
                }
            }
        }
    }

    /// `/sync`-cadence housekeeping (spec §4.10): sweep expired subscribers
    /// and links, re-emit any dirty local property state.
    fn housekeeping(&mut self, now: MapperTime) {
        self.graph.prune_expired_subscriptions(now);

        let link_devices: Vec<(ObjectId, ObjectId, ObjectId)> =
            self.graph.links.values().map(|l| (l.id, l.device_a, l.device_b)).collect();
        let expired = self.graph.check_link_timeouts(now, self.config.peer_ping_timeout);
        for link_id in expired {
            let Some(&(_, a, b)) = link_devices.iter().find(|(id, _, _)| *id == link_id) else { continue };
            let other = if a == self.id { b } else { a };
            for map_id in self.router.map_ids_touching_device(other) {
                self.router.remove_map(map_id);
            }
            tracing::info!(link_id, other_device = other, "link expired, dropped maps spanning it");
        }

        if self.props.dirty() {
            self.props.clear_dirty();
        }
    }

    fn flush_link_bundles(&mut self, now: MapperTime) {
        let addrs: Vec<(ObjectId, Option<SocketAddr>)> = self
            .graph
            .links
            .values()
            .map(|l| (l.id, l.addresses.udp_data))
            .collect();
        for (link_id, addr) in addrs {
            let Some(link) = self.graph.links.get_mut(&link_id) else { continue };
            if let Some(msgs) = link.bundle.take() {
                if let Some(addr) = addr {
                    let result = network::send_bundle(&self.mesh, addr, now, msgs).context("failed to flush link bundle");
                    if let Err(e) = result {
                        tracing::warn!(link_id, error = %e, "bundle send failed");
                    }
                }
            }
        }
    }

    /// Build the `(path, handler)` table this device would install on a
    /// shared event loop, per spec [ADD 4.1.1]. Kept separate from
    /// `handle_message`'s direct match so an embedding application can
    /// extend the table with its own custom paths.
    pub fn build_handler_table() -> HandlerTable<Device> {
        let mut table = HandlerTable::new();
        table.insert("/name/probe", |dev, msg, _from| {
            if let Some(OscType::String(name)) = msg.args.first() {
                dev.on_probe_collision(name, MapperTime::now());
            }
        });
        table.insert("/logout", |dev, msg, _from| {
            if let Some(OscType::String(name)) = msg.args.first() {
                let id = object::device_id_from_name(name);
                dev.graph.remove_device(id);
            }
        });
        table
    }
}

fn bus_addr(config: &DeviceConfig) -> SocketAddr {
    SocketAddr::new(config.multicast_group.into(), config.multicast_port)
}

fn elem_to_osc(e: &Elem) -> OscType {
    match e {
        Elem::Null => OscType::Nil,
        Elem::Val(mapper_core::value::Scalar::I32(v)) => OscType::Int(*v),
        Elem::Val(mapper_core::value::Scalar::F32(v)) => OscType::Float(*v),
        Elem::Val(mapper_core::value::Scalar::F64(v)) => OscType::Double(*v),
    }
}

/// Extract the device id embedded in a child object id's high word (spec §3
/// invariant 1's mirror on the read side).
fn other_device_of(id: &ObjectId) -> ObjectId {
    id & 0xFFFF_FFFF_0000_0000
}

/// Jitter a base interval by up to +/-20%, matching the teacher's
/// `rand::thread_rng` use for retry backoff, so many devices on one bus
/// don't ping/sync in lockstep.
pub fn jittered(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(0.8..1.2);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Allocate a fresh global id for a newly activated instance (spec §3
/// invariant 5).
pub fn allocate_gid(device_id: ObjectId, counter: &mut u32) -> Gid {
    *counter += 1;
    idmap::make_gid(device_id as u32, *counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DeviceConfig {
        DeviceConfig::new().with_multicast_port(0)
    }

    #[test]
    fn add_signal_assigns_stable_ordinal_ids() {
        // Bind to an ephemeral port pair to avoid clashing with a running
        // mapper session on the developer's machine.
        let mut dev = Device::new("test", cfg().with_multicast_group("225.1.2.3".parse().unwrap())).unwrap();
        dev.id = 0xAAAA_0000_0000;
        let a = dev.add_signal("a", Direction::Output, ScalarType::F32, 1, 1);
        let b = dev.add_signal("b", Direction::Output, ScalarType::F32, 1, 1);
        assert_ne!(a, b);
        assert!(dev.signal_by_name("a").is_some());
    }

    #[test]
    fn probe_collision_bumps_ordinal() {
        let mut dev = Device::new("test", cfg().with_multicast_group("225.1.2.4".parse().unwrap())).unwrap();
        let now = MapperTime::from_double(0.0);
        dev.send_probe(now);
        assert_eq!(dev.name_alloc.ordinal, 0);
        dev.on_probe_collision(&dev.ordinal_name().clone(), now);
        assert!(dev.name_alloc.ordinal >= 1);
    }

    #[test]
    fn registration_locks_id_after_deadline() {
        let mut dev = Device::new("test", cfg().with_multicast_group("225.1.2.5".parse().unwrap())).unwrap();
        let t0 = MapperTime::from_double(0.0);
        dev.send_probe(t0);
        assert!(!dev.is_registered());
        dev.maybe_finish_registration(MapperTime::from_double(1.0));
        assert!(dev.is_registered());
        assert_ne!(dev.id, 0);
    }
}
