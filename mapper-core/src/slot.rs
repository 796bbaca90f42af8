//! Map slot: one endpoint of a map (spec §3, §4.5 "Boundary action").
//!
//! A local slot (the processing endpoint or any endpoint on this device)
//! owns a per-instance value history; a purely remote slot does not.

use crate::idmap::Lid;
use crate::object::ObjectId;
use crate::value::{Elem, History, Scalar, ScalarType, Vector};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotDirection {
    Src,
    Dst,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BoundaryAction {
    #[default]
    None,
    Mute,
    Clamp,
    Fold,
    Wrap,
}

#[derive(Clone, Debug)]
pub struct Slot {
    pub id: u32,
    pub signal_id: ObjectId,
    pub device_id: ObjectId,
    pub direction: SlotDirection,
    pub causes_update: bool,
    pub use_as_instance: bool,
    pub bound_min: BoundaryAction,
    pub bound_max: BoundaryAction,
    pub min: Option<Vec<f64>>,
    pub max: Option<Vec<f64>>,
    pub calibrating: bool,
    pub scalar_type: Option<ScalarType>,
    pub length: Option<usize>,
    /// Local-only: per-instance history, keyed by local instance id.
    pub history: HashMap<Lid, History>,
    pub history_size: usize,
    /// Set once this slot's link address has resolved (spec §4.5 status
    /// machine's per-slot `link_known`).
    pub link_known: bool,
}

impl Slot {
    pub fn new(id: u32, signal_id: ObjectId, device_id: ObjectId, direction: SlotDirection) -> Self {
        Self {
            id,
            signal_id,
            device_id,
            direction,
            causes_update: direction == SlotDirection::Src,
            use_as_instance: false,
            bound_min: BoundaryAction::default(),
            bound_max: BoundaryAction::default(),
            min: None,
            max: None,
            calibrating: false,
            scalar_type: None,
            length: None,
            history: HashMap::new(),
            history_size: 1,
            link_known: false,
        }
    }

    /// Type/length lock (spec §3 invariant 8): once set, further attempts
    /// to change either are rejected.
    pub fn lock_type_length(&mut self, scalar_type: ScalarType, length: usize) -> bool {
        if self.scalar_type.is_some() || self.length.is_some() {
            return self.scalar_type == Some(scalar_type) && self.length == Some(length);
        }
        self.scalar_type = Some(scalar_type);
        self.length = Some(length);
        true
    }

    pub fn is_type_length_known(&self) -> bool {
        self.scalar_type.is_some() && self.length.is_some()
    }

    /// Grow or shrink every active instance's history to `size` (spec §3
    /// invariant 4).
    pub fn resize_histories(&mut self, size: usize) {
        self.history_size = size.max(1);
        for h in self.history.values_mut() {
            h.resize(self.history_size);
        }
    }

    pub fn history_for(&mut self, lid: Lid, vec_len: usize) -> &mut History {
        self.history
            .entry(lid)
            .or_insert_with(|| History::new(self.history_size, vec_len))
    }

    /// Apply this slot's boundary action to a full output vector,
    /// returning `None` if every element ends up muted (spec §4.5
    /// "if all elements become null the update is suppressed").
    pub fn apply_boundary(&self, value: &[Elem]) -> Option<Vector> {
        let min = self.min.as_ref();
        let max = self.max.as_ref();
        let mut out = Vec::with_capacity(value.len());
        let mut any_alive = false;
        for (i, e) in value.iter().enumerate() {
            let elem = match e {
                Elem::Null => Elem::Null,
                Elem::Val(s) => {
                    let lo = min.and_then(|v| v.get(i)).copied();
                    let hi = max.and_then(|v| v.get(i)).copied();
                    match (lo, hi) {
                        (Some(lo), Some(hi)) => {
                            match apply_boundary_scalar(lo, hi, self.bound_min, self.bound_max, s.as_f64()) {
                                Some(v) => Elem::Val(crate::value::coerce(s.scalar_type(), Scalar::F64(v))),
                                None => Elem::Null,
                            }
                        }
                        _ => Elem::Val(*s),
                    }
                }
            };
            if !elem.is_null() {
                any_alive = true;
            }
            out.push(elem);
        }
        if any_alive {
            Some(out)
        } else {
            None
        }
    }
}

fn bound_once(lo: f64, hi: f64, action: BoundaryAction, violates_lo: bool, x: f64) -> Option<f64> {
    match action {
        BoundaryAction::None => Some(x),
        BoundaryAction::Mute => None,
        BoundaryAction::Clamp => Some(if violates_lo { lo } else { hi }),
        BoundaryAction::Wrap => Some(wrap(x, lo, hi)),
        BoundaryAction::Fold => Some(if violates_lo { lo + (lo - x) } else { hi - (x - hi) }),
    }
}

fn wrap(x: f64, lo: f64, hi: f64) -> f64 {
    let range = hi - lo;
    if range <= 0.0 {
        return lo;
    }
    let mut v = (x - lo) % range;
    if v < 0.0 {
        v += range;
    }
    lo + v
}

/// `bound_min`/`bound_max` applied to one scalar element (spec §4.5
/// "Boundary action"). Swaps bounds along with their actions if `min` and
/// `max` arrived swapped. `fold` reflects once; if the reflection still
/// violates the opposite bound, that bound's action is applied once more
/// (one level of recursion, per spec).
pub fn apply_boundary_scalar(
    min: f64,
    max: f64,
    bound_min: BoundaryAction,
    bound_max: BoundaryAction,
    x: f64,
) -> Option<f64> {
    let (lo, hi, blo, bhi) = if min <= max {
        (min, max, bound_min, bound_max)
    } else {
        (max, min, bound_max, bound_min)
    };

    if x < lo {
        let once = bound_once(lo, hi, blo, true, x)?;
        if once > hi {
            bound_once(lo, hi, bhi, false, once)
        } else if once < lo {
            Some(lo)
        } else {
            Some(once)
        }
    } else if x > hi {
        let once = bound_once(lo, hi, bhi, false, x)?;
        if once < lo {
            bound_once(lo, hi, blo, true, once)
        } else if once > hi {
            Some(hi)
        } else {
            Some(once)
        }
    } else {
        Some(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_saturates() {
        assert_eq!(
            apply_boundary_scalar(0.0, 10.0, BoundaryAction::Clamp, BoundaryAction::Clamp, -5.0),
            Some(0.0)
        );
        assert_eq!(
            apply_boundary_scalar(0.0, 10.0, BoundaryAction::Clamp, BoundaryAction::Clamp, 15.0),
            Some(10.0)
        );
    }

    #[test]
    fn clamp_is_idempotent() {
        let once = apply_boundary_scalar(0.0, 10.0, BoundaryAction::Clamp, BoundaryAction::Clamp, -5.0).unwrap();
        let twice = apply_boundary_scalar(0.0, 10.0, BoundaryAction::Clamp, BoundaryAction::Clamp, once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn wrap_stays_in_range() {
        let v = apply_boundary_scalar(0.0, 10.0, BoundaryAction::Wrap, BoundaryAction::Wrap, 23.0).unwrap();
        assert!((0.0..=10.0).contains(&v));
    }

    #[test]
    fn wrap_is_idempotent_in_range() {
        let once = apply_boundary_scalar(0.0, 10.0, BoundaryAction::Wrap, BoundaryAction::Wrap, 23.0).unwrap();
        let twice = apply_boundary_scalar(0.0, 10.0, BoundaryAction::Wrap, BoundaryAction::Wrap, once).unwrap();
        assert!((once - twice).abs() < 1e-9);
    }

    #[test]
    fn fold_reflects_across_bound() {
        let v = apply_boundary_scalar(0.0, 10.0, BoundaryAction::Fold, BoundaryAction::Fold, -2.0).unwrap();
        assert_eq!(v, 2.0);
    }

    #[test]
    fn mute_nulls_element() {
        assert_eq!(
            apply_boundary_scalar(0.0, 10.0, BoundaryAction::Mute, BoundaryAction::Mute, -2.0),
            None
        );
    }

    #[test]
    fn type_length_lock_rejects_change() {
        let mut s = Slot::new(0, 1, 1, SlotDirection::Src);
        assert!(s.lock_type_length(ScalarType::F32, 1));
        assert!(!s.lock_type_length(ScalarType::I32, 1));
        assert_eq!(s.scalar_type, Some(ScalarType::F32));
    }
}
