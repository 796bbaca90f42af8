//! Router: per-device table from local signals to the map slots that
//! reference them (spec §4.7).
//!
//! Maps are owned here, keyed by id, with each `RouterSignal` holding
//! back-pointers (map ids only) the way the graph/router relationship in
//! spec §3 Ownership describes: the router never owns a signal, only the
//! set of maps touching it.

use crate::idmap::Lid;
use crate::map::{Map, ProcessLocation};
use crate::object::ObjectId;
use crate::slot::SlotDirection;
use crate::time::MapperTime;
use crate::value::{Elem, Vector};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::HashMap;

#[derive(Clone, Debug, Default)]
pub struct RouterSignal {
    pub outgoing_maps: Vec<ObjectId>,
    pub incoming_maps: Vec<ObjectId>,
}

/// One routed result: either a value to forward/apply, or a release,
/// tagged with the map and local instance it came from (spec §4.6 eval
/// bitmask, §4.7 outbound/inbound path).
#[derive(Clone, Debug)]
pub struct RoutedUpdate {
    pub map_id: ObjectId,
    pub dest_signal_id: ObjectId,
    pub dest_slot_id: Option<u32>,
    pub lid: Lid,
    pub value: Option<Vector>,
    pub release_before: bool,
    pub release_after: bool,
    pub muted: bool,
}

#[derive(Default)]
pub struct Router {
    signals: HashMap<ObjectId, RouterSignal>,
    maps: HashMap<ObjectId, Map>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self, id: ObjectId) -> Option<&Map> {
        self.maps.get(&id)
    }

    pub fn map_mut(&mut self, id: ObjectId) -> Option<&mut Map> {
        self.maps.get_mut(&id)
    }

    /// Insert a new map, refusing it if it would close a feedback loop
    /// back through an existing chain of maps (spec §4.7 "Loop protection",
    /// DFS over the router-signal graph).
    pub fn add_map(&mut self, map: Map) -> Result<ObjectId, crate::error::MapperError> {
        for src in &map.sources {
            if self.would_create_loop(src.signal_id, map.destination.signal_id) {
                return Err(crate::error::MapperError::LoopDetected(format!(
                    "map {} -> {} would close a feedback loop",
                    src.signal_id, map.destination.signal_id
                )));
            }
        }
        let id = map.id;
        for src in &map.sources {
            self.signals.entry(src.signal_id).or_default().outgoing_maps.push(id);
        }
        self.signals
            .entry(map.destination.signal_id)
            .or_default()
            .incoming_maps
            .push(id);
        self.maps.insert(id, map);
        Ok(id)
    }

    /// Ids of every map with at least one endpoint on `device_id` (spec
    /// §4.8: a broken link invalidates every map that crosses it).
    pub fn map_ids_touching_device(&self, device_id: ObjectId) -> Vec<ObjectId> {
        self.maps
            .iter()
            .filter(|(_, m)| m.destination.device_id == device_id || m.sources.iter().any(|s| s.device_id == device_id))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn remove_map(&mut self, id: ObjectId) -> Option<Map> {
        let map = self.maps.remove(&id)?;
        for src in &map.sources {
            if let Some(rs) = self.signals.get_mut(&src.signal_id) {
                rs.outgoing_maps.retain(|m| *m != id);
            }
        }
        if let Some(rs) = self.signals.get_mut(&map.destination.signal_id) {
            rs.incoming_maps.retain(|m| *m != id);
        }
        Some(map)
    }

    /// Would adding an edge `new_source -> new_dest` close a cycle, given
    /// the maps already registered? True iff `new_dest` can already reach
    /// `new_source` through the existing source->destination edges.
    fn would_create_loop(&self, new_source: ObjectId, new_dest: ObjectId) -> bool {
        if new_source == new_dest {
            return true;
        }
        let mut graph = DiGraph::<ObjectId, ()>::new();
        let mut nodes: HashMap<ObjectId, NodeIndex> = HashMap::new();
        let mut node_of = |g: &mut DiGraph<ObjectId, ()>, nodes: &mut HashMap<ObjectId, NodeIndex>, id: ObjectId| -> NodeIndex {
            *nodes.entry(id).or_insert_with(|| g.add_node(id))
        };
        for m in self.maps.values() {
            let dst = node_of(&mut graph, &mut nodes, m.destination.signal_id);
            for src in &m.sources {
                let s = node_of(&mut graph, &mut nodes, src.signal_id);
                graph.add_edge(s, dst, ());
            }
        }
        let Some(&start) = nodes.get(&new_dest) else {
            return false;
        };
        let Some(&target) = nodes.get(&new_source) else {
            return false;
        };
        let mut dfs = Dfs::new(&graph, start);
        while let Some(n) = dfs.next(&graph) {
            if n == target {
                return true;
            }
        }
        false
    }

    /// Outbound path (spec §4.7 `process_sig`): a local write to `signal_id`
    /// fans out through every active, non-muted outgoing map whose scope
    /// admits `origin_device`.
    pub fn process_outgoing(
        &mut self,
        signal_id: ObjectId,
        lid: Lid,
        value: &[Elem],
        origin_device: ObjectId,
        now: MapperTime,
    ) -> Vec<RoutedUpdate> {
        let is_release = value.iter().all(|e| e.is_null());
        let map_ids = self
            .signals
            .get(&signal_id)
            .map(|rs| rs.outgoing_maps.clone())
            .unwrap_or_default();

        let mut out = Vec::new();
        for map_id in map_ids {
            let Some(map) = self.maps.get_mut(&map_id) else { continue };
            if map.status != crate::map::MapStatus::Active || map.muted {
                continue;
            }
            if !is_release && !map.scope.admits(origin_device) {
                continue;
            }
            let Some(src) = map.sources.iter_mut().find(|s| s.signal_id == signal_id) else { continue };
            let len = src.length.unwrap_or(value.len());
            src.history_for(lid, len).push(value.to_vec(), now);

            match map.process_location {
                ProcessLocation::Source => {
                    let Some(eval_out) = map.evaluate(lid, now) else { continue };
                    let bounded = eval_out
                        .value
                        .as_ref()
                        .and_then(|v| map.destination.apply_boundary(v));
                    if let Some(v) = &bounded {
                        map.destination.history_for(lid, v.len()).push(v.clone(), now);
                    }
                    out.push(RoutedUpdate {
                        map_id,
                        dest_signal_id: map.destination.signal_id,
                        dest_slot_id: None,
                        lid,
                        value: bounded,
                        release_before: eval_out.flags.contains(crate::expr::EvalFlags::RELEASE_BEFORE_UPDATE),
                        release_after: eval_out.flags.contains(crate::expr::EvalFlags::RELEASE_AFTER_UPDATE),
                        muted: eval_out.flags.contains(crate::expr::EvalFlags::MUTED),
                    });
                }
                ProcessLocation::Destination => {
                    let slot_id = map
                        .sources
                        .iter()
                        .find(|s| s.signal_id == signal_id)
                        .map(|s| s.id);
                    out.push(RoutedUpdate {
                        map_id,
                        dest_signal_id: map.destination.signal_id,
                        dest_slot_id: slot_id,
                        lid,
                        value: if is_release { None } else { Some(value.to_vec()) },
                        release_before: false,
                        release_after: is_release,
                        muted: false,
                    });
                }
            }
        }
        out
    }

    /// Inbound path (spec §4.7): a message arriving at a destination-
    /// processed map's source slot. Identifies the slot by the carried
    /// `slot_id` when present, appends to its history, and — when this map
    /// processes at the destination — evaluates immediately.
    pub fn process_incoming(
        &mut self,
        dest_signal_id: ObjectId,
        slot_id: Option<u32>,
        lid: Lid,
        value: &[Elem],
        now: MapperTime,
    ) -> Vec<RoutedUpdate> {
        let is_release = value.iter().all(|e| e.is_null());
        let map_ids = self
            .signals
            .get(&dest_signal_id)
            .map(|rs| rs.incoming_maps.clone())
            .unwrap_or_default();

        let mut out = Vec::new();
        for map_id in map_ids {
            let Some(map) = self.maps.get_mut(&map_id) else { continue };
            if map.status != crate::map::MapStatus::Active || map.muted {
                continue;
            }
            let target = match slot_id {
                Some(id) => map.sources.iter_mut().find(|s| s.id == id && s.direction == SlotDirection::Src),
                None => map.sources.iter_mut().find(|s| s.direction == SlotDirection::Src),
            };
            let Some(src) = target else { continue };
            let len = src.length.unwrap_or(value.len());
            src.history_for(lid, len).push(value.to_vec(), now);

            if map.process_location != ProcessLocation::Destination {
                continue;
            }
            let Some(eval_out) = map.evaluate(lid, now) else { continue };
            let bounded = eval_out
                .value
                .as_ref()
                .and_then(|v| map.destination.apply_boundary(v));
            if let Some(v) = &bounded {
                map.destination.history_for(lid, v.len()).push(v.clone(), now);
            }
            out.push(RoutedUpdate {
                map_id,
                dest_signal_id,
                dest_slot_id: None,
                lid,
                value: if is_release { None } else { bounded },
                release_before: eval_out.flags.contains(crate::expr::EvalFlags::RELEASE_BEFORE_UPDATE),
                release_after: is_release || eval_out.flags.contains(crate::expr::EvalFlags::RELEASE_AFTER_UPDATE),
                muted: eval_out.flags.contains(crate::expr::EvalFlags::MUTED),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Slot;
    use crate::value::{Scalar, ScalarType};

    fn slot(id: u32, dir: SlotDirection, signal_id: ObjectId, device: ObjectId) -> Slot {
        let mut s = Slot::new(id, signal_id, device, dir);
        s.lock_type_length(ScalarType::F32, 1);
        s.link_known = true;
        s
    }

    #[test]
    fn direct_self_loop_rejected() {
        let mut r = Router::new();
        let src = slot(0, SlotDirection::Src, 10, 1);
        let dst = slot(0, SlotDirection::Dst, 10, 1);
        let mut m = Map::new(1, vec![src], dst);
        m.compile_expression(None, true).unwrap();
        assert!(r.add_map(m).is_err());
    }

    #[test]
    fn transitive_loop_rejected() {
        let mut r = Router::new();

        let mut m1 = Map::new(
            1,
            vec![slot(0, SlotDirection::Src, 100, 1)],
            slot(0, SlotDirection::Dst, 200, 1),
        );
        m1.compile_expression(None, true).unwrap();
        r.add_map(m1).unwrap();

        let mut m2 = Map::new(
            2,
            vec![slot(0, SlotDirection::Src, 200, 1)],
            slot(0, SlotDirection::Dst, 100, 1),
        );
        m2.compile_expression(None, true).unwrap();
        assert!(r.add_map(m2).is_err());
    }

    #[test]
    fn outbound_identity_map_produces_routed_update() {
        let mut r = Router::new();
        let mut m = Map::new(
            1,
            vec![slot(0, SlotDirection::Src, 100, 1)],
            slot(0, SlotDirection::Dst, 200, 1),
        );
        m.compile_expression(None, true).unwrap();
        m.activate();
        r.add_map(m).unwrap();

        let updates = r.process_outgoing(
            100,
            1,
            &[Elem::Val(Scalar::F32(5.0))],
            1,
            MapperTime::from_double(1.0),
        );
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].dest_signal_id, 200);
        assert_eq!(updates[0].value.as_ref().unwrap()[0].as_f64(), Some(5.0));
    }
}
