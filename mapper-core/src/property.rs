//! Per-object typed property store with synced/staged views (spec §4.9).
//!
//! Every device/signal/map/link carries one of these. Local mutations land
//! straight in `synced` and bump the object version; remote-modify requests
//! land in `staged` until the owning endpoint commits them.

use crate::time::MapperTime;
use std::collections::BTreeMap;

/// Densely allocated well-known property keys (spec §4.9 / ADD 4.9.1),
/// matching `original_source/src/properties.c`. `Other` escapes to a
/// user-defined key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Prop {
    Id,
    Name,
    Type,
    Length,
    Direction,
    Min,
    Max,
    Unit,
    Rate,
    Instances,
    Steal,
    Expression,
    Mode,
    ProcessAt,
    Scope,
    Port,
    Host,
    Lease,
    Version,
    Other(String),
}

impl Prop {
    /// Dense index for the small direct-array storage spec §4.9 gestures at.
    pub fn ordinal(&self) -> usize {
        match self {
            Prop::Id => 0,
            Prop::Name => 1,
            Prop::Type => 2,
            Prop::Length => 3,
            Prop::Direction => 4,
            Prop::Min => 5,
            Prop::Max => 6,
            Prop::Unit => 7,
            Prop::Rate => 8,
            Prop::Instances => 9,
            Prop::Steal => 10,
            Prop::Expression => 11,
            Prop::Mode => 12,
            Prop::ProcessAt => 13,
            Prop::Scope => 14,
            Prop::Port => 15,
            Prop::Host => 16,
            Prop::Lease => 17,
            Prop::Version => 18,
            Prop::Other(_) => 19,
        }
    }

    pub fn key_str(&self) -> &str {
        match self {
            Prop::Id => "id",
            Prop::Name => "name",
            Prop::Type => "type",
            Prop::Length => "length",
            Prop::Direction => "direction",
            Prop::Min => "min",
            Prop::Max => "max",
            Prop::Unit => "unit",
            Prop::Rate => "rate",
            Prop::Instances => "instances",
            Prop::Steal => "steal",
            Prop::Expression => "expression",
            Prop::Mode => "mode",
            Prop::ProcessAt => "processAt",
            Prop::Scope => "scope",
            Prop::Port => "port",
            Prop::Host => "host",
            Prop::Lease => "lease",
            Prop::Version => "version",
            Prop::Other(s) => s.as_str(),
        }
    }

    pub fn from_key_str(s: &str) -> Prop {
        match s {
            "id" => Prop::Id,
            "name" => Prop::Name,
            "type" => Prop::Type,
            "length" => Prop::Length,
            "direction" => Prop::Direction,
            "min" => Prop::Min,
            "max" => Prop::Max,
            "unit" => Prop::Unit,
            "rate" => Prop::Rate,
            "instances" => Prop::Instances,
            "steal" => Prop::Steal,
            "expression" => Prop::Expression,
            "mode" => Prop::Mode,
            "processAt" => Prop::ProcessAt,
            "scope" => Prop::Scope,
            "port" => Prop::Port,
            "host" => Prop::Host,
            "lease" => Prop::Lease,
            "version" => Prop::Version,
            other => Prop::Other(other.to_string()),
        }
    }
}

/// A property's value, wide enough to cover everything the wire format
/// carries (spec §6.1): numeric scalars and vectors, strings, booleans,
/// chars, and timetags.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    I32(i32),
    F32(f32),
    F64(f64),
    Str(String),
    Bool(bool),
    Char(char),
    Time(MapperTime),
    I32Vec(Vec<i32>),
    F32Vec(Vec<f32>),
    F64Vec(Vec<f64>),
    StrVec(Vec<String>),
}

/// Minimal hand-rolled bitflags, avoiding an extra dependency for seven
/// constant bits.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct $name(pub $ty);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            pub const NONE: $name = $name(0);

            pub fn contains(&self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_lite! {
    /// Access-control flags on a property record (spec §4.9).
    pub struct PropFlags: u8 {
        const NON_MODIFIABLE     = 0b0000_0001;
        const LOCAL_MODIFY       = 0b0000_0010;
        const REMOTE_MODIFY      = 0b0000_0100;
        const LOCAL_ACCESS_ONLY  = 0b0000_1000;
        const INDIRECT           = 0b0001_0000;
        const MUTABLE_LENGTH     = 0b0010_0000;
        const MUTABLE_TYPE       = 0b0100_0000;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PropRecord {
    pub prop: Prop,
    pub value: PropValue,
    pub flags: PropFlags,
}

/// One object's property store: the committed `synced` view plus a
/// `staged` view for pending remote-modify requests (spec §4.9).
#[derive(Clone, Debug, Default)]
pub struct PropertyTable {
    synced: BTreeMap<Prop, PropRecord>,
    staged: BTreeMap<Prop, PropRecord>,
    version: u64,
    dirty: bool,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Set a synced property directly (the local-authoring path). Rejects
    /// the write if the existing record (if any) is `NON_MODIFIABLE` or
    /// lacks `LOCAL_MODIFY`, bumping the version and marking dirty only on
    /// an actual change.
    pub fn set(&mut self, prop: Prop, value: PropValue, flags: PropFlags) -> bool {
        if let Some(existing) = self.synced.get(&prop) {
            if existing.flags.contains(PropFlags::NON_MODIFIABLE) {
                return false;
            }
            if existing.value == value {
                return false;
            }
        }
        self.synced.insert(
            prop.clone(),
            PropRecord {
                prop,
                value,
                flags,
            },
        );
        self.version += 1;
        self.dirty = true;
        true
    }

    pub fn get_by_prop(&self, prop: &Prop) -> Option<&PropRecord> {
        self.synced.get(prop)
    }

    pub fn get_by_key(&self, key: &str) -> Option<&PropRecord> {
        let prop = Prop::from_key_str(key);
        self.get_by_prop(&prop)
    }

    /// Stage a remote-modify request; it is not visible via `get_by_prop`
    /// until `commit_staged` applies it (only the processing endpoint may
    /// commit, spec §4.5 `/map/modify`).
    pub fn stage(&mut self, prop: Prop, value: PropValue) {
        self.staged.insert(
            prop.clone(),
            PropRecord {
                prop,
                value,
                flags: PropFlags::NONE,
            },
        );
    }

    pub fn commit_staged(&mut self) {
        for (prop, record) in std::mem::take(&mut self.staged) {
            if let Some(existing) = self.synced.get(&prop) {
                if existing.flags.contains(PropFlags::NON_MODIFIABLE) {
                    continue;
                }
            }
            self.synced.insert(prop, record);
        }
        self.version += 1;
        self.dirty = true;
    }

    /// Yield all records not flagged `LOCAL_ACCESS_ONLY`, the
    /// `add_to_msg` contract of spec §4.9.
    pub fn iter_wire_visible(&self) -> impl Iterator<Item = &PropRecord> {
        self.synced
            .values()
            .filter(|r| !r.flags.contains(PropFlags::LOCAL_ACCESS_ONLY))
    }

    pub fn remove(&mut self, prop: &Prop) {
        if self.synced.remove(prop).is_some() {
            self.version += 1;
            self.dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bumps_version_only_on_change() {
        let mut t = PropertyTable::new();
        assert!(t.set(Prop::Name, PropValue::Str("a".into()), PropFlags::NONE));
        let v1 = t.version();
        assert!(!t.set(Prop::Name, PropValue::Str("a".into()), PropFlags::NONE));
        assert_eq!(t.version(), v1);
        assert!(t.set(Prop::Name, PropValue::Str("b".into()), PropFlags::NONE));
        assert!(t.version() > v1);
    }

    #[test]
    fn non_modifiable_rejects_overwrite() {
        let mut t = PropertyTable::new();
        t.set(Prop::Id, PropValue::I32(1), PropFlags::NON_MODIFIABLE);
        assert!(!t.set(Prop::Id, PropValue::I32(2), PropFlags::NONE));
        assert_eq!(t.get_by_prop(&Prop::Id).unwrap().value, PropValue::I32(1));
    }

    #[test]
    fn local_access_only_excluded_from_wire() {
        let mut t = PropertyTable::new();
        t.set(Prop::Name, PropValue::Str("dev".into()), PropFlags::NONE);
        t.set(Prop::Other("secret".into()), PropValue::Bool(true), PropFlags::LOCAL_ACCESS_ONLY);
        let visible: Vec<_> = t.iter_wire_visible().collect();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].prop, Prop::Name);
    }
}
