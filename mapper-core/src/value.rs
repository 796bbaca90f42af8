//! Typed scalars, vectors, and the per-instance value history buffer.
//!
//! Every numeric value in the system is one of three scalar types; vectors
//! are homogeneous in type but each element may independently be "null"
//! (the wire encoding of mute/release, spec §4.5 boundary actions and
//! §6.2 instance release).

use crate::error::MapperError;
use crate::time::MapperTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarType {
    I32,
    F32,
    F64,
}

impl ScalarType {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::I32 => "i32",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    I32(i32),
    F32(f32),
    F64(f64),
}

impl Scalar {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Scalar::I32(_) => ScalarType::I32,
            Scalar::F32(_) => ScalarType::F32,
            Scalar::F64(_) => ScalarType::F64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Scalar::I32(v) => *v as f64,
            Scalar::F32(v) => *v as f64,
            Scalar::F64(v) => *v,
        }
    }
}

/// A single vector element: either a value, or `Null`, the OSC `N` tag used
/// to mute an element or mark a whole update as an instance release.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Elem {
    Val(Scalar),
    Null,
}

impl Elem {
    pub fn is_null(&self) -> bool {
        matches!(self, Elem::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Elem::Val(s) => Some(s.as_f64()),
            Elem::Null => None,
        }
    }
}

pub type Vector = Vec<Elem>;

/// Consolidated value coercion: the single place every min/max, history,
/// and message-atom move between scalar types passes through (design notes
/// §9 — "manual value coercion").
pub fn coerce(dst_type: ScalarType, src: Scalar) -> Scalar {
    match dst_type {
        ScalarType::I32 => Scalar::I32(match src {
            Scalar::I32(v) => v,
            Scalar::F32(v) => v.round() as i32,
            Scalar::F64(v) => v.round() as i32,
        }),
        ScalarType::F32 => Scalar::F32(match src {
            Scalar::I32(v) => v as f32,
            Scalar::F32(v) => v,
            Scalar::F64(v) => v as f32,
        }),
        ScalarType::F64 => Scalar::F64(match src {
            Scalar::I32(v) => v as f64,
            Scalar::F32(v) => v as f64,
            Scalar::F64(v) => v,
        }),
    }
}

pub fn coerce_elem(dst_type: ScalarType, src: Elem) -> Elem {
    match src {
        Elem::Null => Elem::Null,
        Elem::Val(s) => Elem::Val(coerce(dst_type, s)),
    }
}

/// Check a vector's scalar type matches `expected`, returning the
/// `TypeMismatch` error otherwise (all non-null elements must agree).
pub fn check_type(expected: ScalarType, vec: &[Elem]) -> Result<(), MapperError> {
    for e in vec {
        if let Elem::Val(s) = e {
            if s.scalar_type() != expected {
                return Err(MapperError::TypeMismatch {
                    expected: expected.name().to_string(),
                    actual: s.scalar_type().name().to_string(),
                });
            }
        }
    }
    Ok(())
}

/// A circular history of typed vectors with timestamps, indexed by negative
/// offset from the most recent sample (spec §4.6): `0` is current, `-1` is
/// the previous sample, down to `-(size-1)`.
#[derive(Clone, Debug)]
pub struct History {
    size: usize,
    /// -1 means empty.
    position: isize,
    values: Vec<Vector>,
    times: Vec<MapperTime>,
}

impl History {
    pub fn new(size: usize, vec_len: usize) -> Self {
        Self {
            size: size.max(1),
            position: -1,
            values: vec![vec![Elem::Null; vec_len]; size.max(1)],
            times: vec![MapperTime::ZERO; size.max(1)],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.position < 0
    }

    /// Advance the cursor and store a new sample, matching the teacher's
    /// `reallocate_*_histories` invariant: growing preserves past samples,
    /// shrinking keeps only the most recent `size`.
    pub fn push(&mut self, value: Vector, time: MapperTime) {
        self.position = (self.position + 1) % self.size as isize;
        self.values[self.position as usize] = value;
        self.times[self.position as usize] = time;
    }

    /// Read by negative index: `0` = current sample, `-(size-1)` = oldest
    /// still retained. Returns `None` if the history is empty or the index
    /// is out of bounds.
    pub fn get(&self, neg_index: usize) -> Option<(&Vector, MapperTime)> {
        if self.is_empty() || neg_index >= self.size {
            return None;
        }
        let idx = (self.position - neg_index as isize).rem_euclid(self.size as isize);
        Some((&self.values[idx as usize], self.times[idx as usize]))
    }

    /// Grow or shrink the buffer to `new_size`, preserving the most recent
    /// samples (spec §3 invariant 4: history length tracks the expression's
    /// maximum referenced past index).
    pub fn resize(&mut self, new_size: usize) {
        let new_size = new_size.max(1);
        if new_size == self.size {
            return;
        }
        let mut new_values = vec![vec![Elem::Null; self.vec_len()]; new_size];
        let mut new_times = vec![MapperTime::ZERO; new_size];
        let keep = new_size.min(self.size);
        for i in 0..keep {
            if let Some((v, t)) = self.get(i) {
                new_values[keep - 1 - i] = v.clone();
                new_times[keep - 1 - i] = t;
            }
        }
        self.values = new_values;
        self.times = new_times;
        self.position = if self.is_empty() { -1 } else { keep as isize - 1 };
        self.size = new_size;
    }

    fn vec_len(&self) -> usize {
        self.values.first().map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_read_negative_index() {
        let mut h = History::new(3, 1);
        h.push(vec![Elem::Val(Scalar::F64(1.0))], MapperTime::from_double(1.0));
        h.push(vec![Elem::Val(Scalar::F64(2.0))], MapperTime::from_double(2.0));
        h.push(vec![Elem::Val(Scalar::F64(3.0))], MapperTime::from_double(3.0));
        assert_eq!(h.get(0).unwrap().0[0].as_f64(), Some(3.0));
        assert_eq!(h.get(1).unwrap().0[0].as_f64(), Some(2.0));
        assert_eq!(h.get(2).unwrap().0[0].as_f64(), Some(1.0));
    }

    #[test]
    fn wraps_around_when_full() {
        let mut h = History::new(2, 1);
        h.push(vec![Elem::Val(Scalar::F64(1.0))], MapperTime::ZERO);
        h.push(vec![Elem::Val(Scalar::F64(2.0))], MapperTime::ZERO);
        h.push(vec![Elem::Val(Scalar::F64(3.0))], MapperTime::ZERO);
        assert_eq!(h.get(0).unwrap().0[0].as_f64(), Some(3.0));
        assert_eq!(h.get(1).unwrap().0[0].as_f64(), Some(2.0));
        assert!(h.get(2).is_none());
    }

    #[test]
    fn coerce_rounds_floats_to_int() {
        let v = coerce(ScalarType::I32, Scalar::F64(2.6));
        assert_eq!(v, Scalar::I32(3));
    }
}
