//! Map: the directed transformation from 1..N source slots to one
//! destination slot (spec §3, §4.5).

use crate::error::MapperError;
use crate::expr::{self, eval, ExprProgram, SrcRange};
use crate::idmap::Lid;
use crate::object::ObjectId;
use crate::slot::{Slot, SlotDirection};
use crate::time::MapperTime;
use crate::value::History;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessLocation {
    Source,
    Destination,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Expression,
    Linear,
}

/// Monotonic status progression except the `active -> expired` edge (spec
/// §4.5 status state machine). Declaration order is the progression order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MapStatus {
    Staged,
    TypeKnown,
    LengthKnown,
    LinkKnown,
    Ready,
    Active,
    Expired,
}

/// A map's scope: the set of instance-origin device ids permitted through,
/// plus an "all origins" escape (spec §4.5 "Scope").
#[derive(Clone, Debug, Default)]
pub struct Scope {
    pub all: bool,
    pub devices: HashSet<ObjectId>,
}

impl Scope {
    pub fn admits(&self, device_id: ObjectId) -> bool {
        self.all || self.devices.contains(&device_id)
    }
}

pub struct Map {
    pub id: ObjectId,
    pub sources: Vec<Slot>,
    pub destination: Slot,
    pub process_location: ProcessLocation,
    pub expr_str: Option<String>,
    pub mode: Mode,
    pub protocol: Protocol,
    pub scope: Scope,
    pub muted: bool,
    pub status: MapStatus,
    compiled: Option<eval::Evaluator>,
    var_histories: HashMap<Lid, HashMap<String, History>>,
}

impl Map {
    pub fn new(id: ObjectId, sources: Vec<Slot>, destination: Slot) -> Self {
        Self {
            id,
            sources,
            destination,
            process_location: ProcessLocation::Source,
            expr_str: None,
            mode: Mode::default(),
            protocol: Protocol::default(),
            scope: Scope { all: true, devices: HashSet::new() },
            muted: false,
            status: MapStatus::Staged,
            compiled: None,
            var_histories: HashMap::new(),
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    fn all_types_lengths_known(&self) -> bool {
        self.destination.is_type_length_known() && self.sources.iter().all(|s| s.is_type_length_known())
    }

    fn all_links_known(&self) -> bool {
        self.destination.link_known && self.sources.iter().all(|s| s.link_known)
    }

    /// Source slots belonging to more than one device, or an expression
    /// referencing destination history, force the destination to process
    /// (spec §3 invariants 2, 3).
    pub fn determine_process_location(sources: &[Slot], program: Option<&ExprProgram>) -> ProcessLocation {
        let distinct: HashSet<ObjectId> = sources.iter().map(|s| s.device_id).collect();
        if distinct.len() > 1 {
            return ProcessLocation::Destination;
        }
        if let Some(p) = program {
            if p.references_dst_history() {
                return ProcessLocation::Destination;
            }
        }
        ProcessLocation::Source
    }

    fn build_default_program(&self) -> ExprProgram {
        let num_sources = self.sources.len();
        let src_len = self.sources.first().and_then(|s| s.length).unwrap_or(1);
        let dst_len = self.destination.length.unwrap_or(1);
        if self.mode == Mode::Linear && num_sources == 1 {
            if let (Some(smin), Some(smax), Some(dmin), Some(dmax)) = (
                self.sources[0].min.as_ref().and_then(|v| v.first()).copied(),
                self.sources[0].max.as_ref().and_then(|v| v.first()).copied(),
                self.destination.min.as_ref().and_then(|v| v.first()).copied(),
                self.destination.max.as_ref().and_then(|v| v.first()).copied(),
            ) {
                return expr::default::build_linear(
                    SrcRange { min: smin, max: smax },
                    SrcRange { min: dmin, max: dmax },
                );
            }
        }
        expr::default::build_identity_or_average(num_sources, src_len, dst_len)
    }

    /// Parse (or generate) and compile the map's expression, sizing every
    /// slot's history. `is_processing_endpoint` tells us whether the caller
    /// (the local device) is the endpoint that must hold the compiled
    /// evaluator; otherwise the raw string is kept for the peer to compile
    /// (spec §4.5 "Expression compilation").
    pub fn compile_expression(
        &mut self,
        expr_str: Option<String>,
        is_processing_endpoint: bool,
    ) -> Result<(), MapperError> {
        if !self.all_types_lengths_known() {
            self.expr_str = expr_str;
            return Ok(());
        }

        let program = match &expr_str {
            Some(s) => expr::parser::parse(s)?,
            None => self.build_default_program(),
        };

        self.process_location = Self::determine_process_location(&self.sources, Some(&program));
        self.expr_str = expr_str;

        if !is_processing_endpoint {
            self.compiled = None;
            return Ok(());
        }

        let num_sources = self.sources.len();
        let dst_type = self.destination.scalar_type.unwrap();
        let dst_len = self.destination.length.unwrap();
        let input_sizes: Vec<usize> = (0..num_sources)
            .map(|i| program.max_src_history(i) as usize + 1)
            .collect();
        let output_size = program.max_dst_history() as usize + 1;
        let user_variables = program.user_variable_names();

        for (i, s) in self.sources.iter_mut().enumerate() {
            s.resize_histories(input_sizes[i]);
        }
        self.destination.resize_histories(output_size);

        self.compiled = Some(eval::Evaluator {
            program,
            num_sources,
            dst_len,
            dst_type,
            input_history_size: input_sizes,
            output_history_size: output_size,
            user_variables,
        });

        Ok(())
    }

    /// Evaluate the compiled expression for local instance `lid`, reading
    /// every source slot's history for that instance plus the destination
    /// slot's own history (for `y{-k}` reads).
    pub fn evaluate(&mut self, lid: Lid, now: MapperTime) -> Option<eval::EvalOutput> {
        let evaluator = self.compiled.as_ref()?;

        let src_hist: Vec<History> = self
            .sources
            .iter()
            .map(|s| {
                s.history
                    .get(&lid)
                    .cloned()
                    .unwrap_or_else(|| History::new(s.history_size, s.length.unwrap_or(1)))
            })
            .collect();
        let dst_hist = self
            .destination
            .history
            .get(&lid)
            .cloned()
            .unwrap_or_else(|| History::new(self.destination.history_size, self.destination.length.unwrap_or(1)));

        let var_hist = self.var_histories.entry(lid).or_default();
        let mut ctx = eval::EvalContext {
            src_histories: &src_hist,
            dst_history: &dst_hist,
            var_histories: var_hist,
        };
        Some(evaluator.eval(&mut ctx, now))
    }

    /// Re-derive `status` from slot readiness (spec §4.5 status machine);
    /// never regresses once `Active`/`Expired` except via `expire`.
    pub fn refresh_status(&mut self) {
        if self.status == MapStatus::Expired {
            return;
        }
        if !self.all_types_lengths_known() {
            return;
        }
        if self.status < MapStatus::LengthKnown {
            self.status = MapStatus::LengthKnown;
        }
        if self.all_links_known() {
            if self.status < MapStatus::LinkKnown {
                self.status = MapStatus::LinkKnown;
            }
            if self.is_compiled() && self.status < MapStatus::Ready {
                self.status = MapStatus::Ready;
            }
        }
    }

    pub fn activate(&mut self) -> bool {
        self.refresh_status();
        if self.status >= MapStatus::Ready {
            self.status = MapStatus::Active;
            true
        } else {
            false
        }
    }

    pub fn expire(&mut self) {
        self.status = MapStatus::Expired;
    }

    pub fn involves_signal(&self, signal_id: ObjectId) -> bool {
        self.destination.signal_id == signal_id || self.sources.iter().any(|s| s.signal_id == signal_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarType;

    fn slot(id: u32, dir: SlotDirection, device: ObjectId) -> Slot {
        let mut s = Slot::new(id, 1, device, dir);
        s.lock_type_length(ScalarType::F32, 1);
        s.link_known = true;
        s
    }

    #[test]
    fn multi_device_sources_force_destination_processing() {
        let src_a = slot(0, SlotDirection::Src, 1);
        let src_b = slot(1, SlotDirection::Src, 2);
        let loc = Map::determine_process_location(&[src_a, src_b], None);
        assert_eq!(loc, ProcessLocation::Destination);
    }

    #[test]
    fn default_single_source_identity_compiles_and_activates() {
        let src = slot(0, SlotDirection::Src, 1);
        let dst = slot(0, SlotDirection::Dst, 1);
        let mut m = Map::new(1, vec![src], dst);
        m.compile_expression(None, true).unwrap();
        assert_eq!(m.process_location, ProcessLocation::Source);
        assert!(m.activate());
        assert_eq!(m.status, MapStatus::Active);
    }

    #[test]
    fn destination_history_reference_forces_destination_and_sizes_history() {
        let src = slot(0, SlotDirection::Src, 1);
        let dst = slot(0, SlotDirection::Dst, 1);
        let mut m = Map::new(1, vec![src], dst);
        m.compile_expression(Some("y=y{-1}*0.9+x*0.1".to_string()), true).unwrap();
        assert_eq!(m.process_location, ProcessLocation::Destination);
        assert_eq!(m.destination.history_size, 2);
    }
}
