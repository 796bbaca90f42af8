//! Signal data model and per-instance state (spec §3, §4.4).
//!
//! A signal owns a reserved pool of instances; each instance is activated
//! the first time it receives a value (or is pushed through the router's
//! incoming path) and is associated with exactly one id-map entry once it
//! goes active on the network.

use crate::error::MapperError;
use crate::idmap::{IdMapTable, Lid};
use crate::object::{ObjectHeader, ObjectId, ObjectKind};
use crate::time::MapperTime;
use crate::value::{check_type, Elem, ScalarType, Vector};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
    Both,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StealMode {
    #[default]
    None,
    Oldest,
    Newest,
}

/// Per-instance status bits (spec §3 Instance lifecycle).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstanceStatus(pub u8);

impl InstanceStatus {
    pub const UPDATED: InstanceStatus = InstanceStatus(0b001);
    pub const RELEASED_LOCALLY: InstanceStatus = InstanceStatus(0b010);
    pub const RELEASED_REMOTELY: InstanceStatus = InstanceStatus(0b100);

    pub fn contains(&self, other: InstanceStatus) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn insert(&mut self, other: InstanceStatus) {
        self.0 |= other.0;
    }
}

#[derive(Clone, Debug)]
pub struct Instance {
    pub lid: Lid,
    pub value: Vector,
    pub has_value: Vec<bool>,
    pub last_update: MapperTime,
    pub active: bool,
    pub status: InstanceStatus,
    pub period: f64,
    pub jitter: f64,
}

impl Instance {
    fn new(lid: Lid, length: usize) -> Self {
        Self {
            lid,
            value: vec![Elem::Null; length],
            has_value: vec![false; length],
            last_update: MapperTime::ZERO,
            active: false,
            status: InstanceStatus::default(),
            period: 0.0,
            jitter: 0.0,
        }
    }

    pub fn has_full_value(&self) -> bool {
        !self.has_value.is_empty() && self.has_value.iter().all(|b| *b)
    }
}

pub struct Signal {
    pub header: ObjectHeader,
    pub device_id: ObjectId,
    pub name: String,
    pub direction: Direction,
    pub scalar_type: ScalarType,
    pub length: usize,
    pub unit: Option<String>,
    pub min: Option<Vector>,
    pub max: Option<Vector>,
    pub rate: Option<f64>,
    pub ephemeral: bool,
    pub use_instances: bool,
    pub steal_mode: StealMode,
    pub num_inst: usize,
    pub instances: Vec<Instance>,
    pub idmap: IdMapTable,
}

impl Signal {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ObjectId,
        device_id: ObjectId,
        name: impl Into<String>,
        direction: Direction,
        scalar_type: ScalarType,
        length: usize,
        num_inst: usize,
    ) -> Self {
        Self {
            header: ObjectHeader::new(id, ObjectKind::Signal),
            device_id,
            name: name.into(),
            direction,
            scalar_type,
            length: length.max(1),
            unit: None,
            min: None,
            max: None,
            rate: None,
            ephemeral: false,
            use_instances: false,
            steal_mode: StealMode::default(),
            num_inst: num_inst.max(1),
            instances: Vec::new(),
            idmap: IdMapTable::new(num_inst.max(1)),
        }
    }

    pub fn find_instance(&self, lid: Lid) -> Option<&Instance> {
        self.instances.iter().find(|i| i.lid == lid)
    }

    pub fn find_instance_mut(&mut self, lid: Lid) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.lid == lid)
    }

    /// Find or activate the instance for `lid`. If the reserved pool is at
    /// `num_inst` capacity, evicts one per `steal_mode` before allocating
    /// (spec §4.4 "steal_mode governs which active instance is evicted").
    pub fn ensure_instance(&mut self, lid: Lid, now: MapperTime) -> usize {
        if let Some(idx) = self.instances.iter().position(|i| i.lid == lid) {
            return idx;
        }
        if self.instances.len() >= self.num_inst {
            match self.steal_mode {
                StealMode::Oldest => {
                    if let Some((idx, _)) = self
                        .instances
                        .iter()
                        .enumerate()
                        .min_by(|a, b| a.1.last_update.cmp(&b.1.last_update))
                    {
                        self.instances.remove(idx);
                    }
                }
                StealMode::Newest => {
                    if let Some((idx, _)) = self
                        .instances
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.last_update.cmp(&b.1.last_update))
                    {
                        self.instances.remove(idx);
                    }
                }
                StealMode::None => {}
            }
        }
        let mut inst = Instance::new(lid, self.length);
        inst.active = true;
        self.instances.push(inst);
        self.instances.len() - 1
    }

    /// `set_value` (spec §4.4): length must not exceed the signal's, and
    /// type must match. Updates the value partially at offset 0, sets
    /// has-value bits, stamps time, and updates period/jitter statistics.
    pub fn set_value(
        &mut self,
        lid: Lid,
        values: &[Elem],
        now: MapperTime,
    ) -> Result<(), MapperError> {
        if values.len() > self.length {
            return Err(MapperError::LengthMismatch {
                expected: self.length,
                actual: values.len(),
            });
        }
        check_type(self.scalar_type, values)?;

        let idx = self.ensure_instance(lid, now);
        let inst = &mut self.instances[idx];
        if inst.last_update != MapperTime::ZERO {
            let dt = now.diff(&inst.last_update);
            if dt >= 0.0 {
                inst.jitter = 0.9 * inst.jitter + 0.1 * (inst.period - dt).abs();
                inst.period = 0.9 * inst.period + 0.1 * dt;
            }
        }
        for (i, v) in values.iter().enumerate() {
            inst.value[i] = *v;
            inst.has_value[i] = !v.is_null();
        }
        inst.last_update = now;
        inst.active = true;
        inst.status.insert(InstanceStatus::UPDATED);
        Ok(())
    }

    /// `release` (spec §4.4): marks released-locally, decrements the
    /// id-map's local refcount.
    pub fn release(&mut self, lid: Lid, now: MapperTime) {
        if let Some(inst) = self.find_instance_mut(lid) {
            inst.status.insert(InstanceStatus::RELEASED_LOCALLY);
            inst.active = false;
            inst.last_update = now;
        }
        self.idmap.release_locally(lid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Scalar;

    fn sig() -> Signal {
        Signal::new(1, 1, "out", Direction::Output, ScalarType::F32, 1, 4)
    }

    #[test]
    fn set_value_activates_instance() {
        let mut s = sig();
        s.set_value(1, &[Elem::Val(Scalar::F32(5.0))], MapperTime::from_double(1.0))
            .unwrap();
        let inst = s.find_instance(1).unwrap();
        assert!(inst.active);
        assert!(inst.has_full_value());
    }

    #[test]
    fn rejects_wrong_type() {
        let mut s = sig();
        let err = s
            .set_value(1, &[Elem::Val(Scalar::I32(5))], MapperTime::from_double(1.0))
            .unwrap_err();
        assert!(matches!(err, MapperError::TypeMismatch { .. }));
    }

    #[test]
    fn rejects_over_length() {
        let mut s = sig();
        let err = s
            .set_value(
                1,
                &[Elem::Val(Scalar::F32(1.0)), Elem::Val(Scalar::F32(2.0))],
                MapperTime::from_double(1.0),
            )
            .unwrap_err();
        assert!(matches!(err, MapperError::LengthMismatch { .. }));
    }

    #[test]
    fn release_marks_status_and_decrefs() {
        let mut s = sig();
        s.idmap.activate(1, 0x1_0000_0001);
        s.set_value(1, &[Elem::Val(Scalar::F32(1.0))], MapperTime::from_double(1.0))
            .unwrap();
        s.release(1, MapperTime::from_double(2.0));
        let inst = s.find_instance(1).unwrap();
        assert!(inst.status.contains(InstanceStatus::RELEASED_LOCALLY));
        assert!(!inst.active);
    }

    #[test]
    fn oldest_steal_evicts_least_recently_updated() {
        let mut s = Signal::new(1, 1, "out", Direction::Output, ScalarType::F32, 1, 2);
        s.steal_mode = StealMode::Oldest;
        s.set_value(1, &[Elem::Val(Scalar::F32(1.0))], MapperTime::from_double(1.0))
            .unwrap();
        s.set_value(2, &[Elem::Val(Scalar::F32(2.0))], MapperTime::from_double(2.0))
            .unwrap();
        s.set_value(3, &[Elem::Val(Scalar::F32(3.0))], MapperTime::from_double(3.0))
            .unwrap();
        assert!(s.find_instance(1).is_none());
        assert!(s.find_instance(2).is_some());
        assert!(s.find_instance(3).is_some());
    }
}
