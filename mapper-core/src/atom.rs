//! Parses an OSC argument list into `(property-key, type-vector,
//! value-vector)` atoms (spec §4.1 Message Parser).
//!
//! Property arguments are `@key val...`; `+@key` adds to a set-valued
//! property, `-@key` removes. Slot-scoped keys look like `@src.2@min` or
//! `@dst@max`. The OSC codec itself (`rosc`) is out of scope per spec §1 —
//! this module only walks the already-decoded `OscType` list.

use crate::property::{Prop, PropValue};
use crate::value::{Elem, Scalar};
use rosc::OscType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtomOp {
    Set,
    Add,
    Remove,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    None,
    /// `@src.<k>@key`
    Src(usize),
    /// `@dst@key`
    Dst,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MsgAtom {
    pub prop: Prop,
    pub op: AtomOp,
    pub scope: Scope,
    /// Raw OSC values following the key, before any property-specific
    /// interpretation.
    pub raw: Vec<OscType>,
}

/// Parse `@key`/`+@key`/`-@key` (optionally slot-scoped) out of a leading
/// token, returning `(op, scope, bare_key)`.
fn parse_key(token: &str) -> Option<(AtomOp, Scope, &str)> {
    let (op, rest) = if let Some(r) = token.strip_prefix("+@") {
        (AtomOp::Add, r)
    } else if let Some(r) = token.strip_prefix("-@") {
        (AtomOp::Remove, r)
    } else if let Some(r) = token.strip_prefix('@') {
        (AtomOp::Set, r)
    } else {
        return None;
    };

    if let Some(after_dst) = rest.strip_prefix("dst@") {
        return Some((op, Scope::Dst, after_dst));
    }
    if let Some(after_src) = rest.strip_prefix("src.") {
        if let Some(at) = after_src.find('@') {
            let idx: usize = after_src[..at].parse().ok()?;
            return Some((op, Scope::Src(idx), &after_src[at + 1..]));
        }
    }
    Some((op, Scope::None, rest))
}

/// Walk a flat OSC argument list, grouping each `@key` with the values that
/// follow it up to the next `@`-prefixed token. Malformed atoms (a
/// non-string in key position) are dropped; parsing continues with the
/// next token (spec §7 `ProtocolParse`: recovered locally).
pub fn parse_atoms(args: &[OscType]) -> Vec<MsgAtom> {
    let mut atoms = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let key_tok = match &args[i] {
            OscType::String(s) => s.as_str(),
            _ => {
                i += 1;
                continue;
            }
        };
        let Some((op, scope, bare_key)) = parse_key(key_tok) else {
            i += 1;
            continue;
        };
        i += 1;
        let start = i;
        while i < args.len() {
            if let OscType::String(s) = &args[i] {
                if s.starts_with('@') || s.starts_with("+@") || s.starts_with("-@") {
                    break;
                }
            }
            i += 1;
        }
        atoms.push(MsgAtom {
            prop: Prop::from_key_str(bare_key),
            op,
            scope,
            raw: args[start..i].to_vec(),
        });
    }
    atoms
}

/// Convert a single OSC atom into a scalar `Elem`, used by the data-path
/// parser for `/<dev>/<sig>` updates (spec §6.2). An all-`Null` payload is
/// the wire encoding of an instance release.
pub fn osc_to_elem(v: &OscType) -> Elem {
    match v {
        OscType::Int(i) => Elem::Val(Scalar::I32(*i)),
        OscType::Float(f) => Elem::Val(Scalar::F32(*f)),
        OscType::Double(d) => Elem::Val(Scalar::F64(*d)),
        OscType::Nil => Elem::Null,
        _ => Elem::Null,
    }
}

/// Interpret an atom's raw values as a best-effort `PropValue`, used when
/// staging/committing generic properties (spec §4.9 `set_from_msg_atom`).
pub fn atom_to_prop_value(raw: &[OscType]) -> Option<PropValue> {
    match raw {
        [OscType::Int(i)] => Some(PropValue::I32(*i)),
        [OscType::Float(f)] => Some(PropValue::F32(*f)),
        [OscType::Double(d)] => Some(PropValue::F64(*d)),
        [OscType::String(s)] => Some(PropValue::Str(s.clone())),
        [OscType::Bool(b)] => Some(PropValue::Bool(*b)),
        [OscType::Char(c)] => Some(PropValue::Char(*c)),
        [] => None,
        many => {
            if many.iter().all(|v| matches!(v, OscType::Int(_))) {
                Some(PropValue::I32Vec(
                    many.iter()
                        .map(|v| match v {
                            OscType::Int(i) => *i,
                            _ => unreachable!(),
                        })
                        .collect(),
                ))
            } else if many.iter().all(|v| matches!(v, OscType::Float(_))) {
                Some(PropValue::F32Vec(
                    many.iter()
                        .map(|v| match v {
                            OscType::Float(f) => *f,
                            _ => unreachable!(),
                        })
                        .collect(),
                ))
            } else if many.iter().all(|v| matches!(v, OscType::String(_))) {
                Some(PropValue::StrVec(
                    many.iter()
                        .map(|v| match v {
                            OscType::String(s) => s.clone(),
                            _ => unreachable!(),
                        })
                        .collect(),
                ))
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_values_under_preceding_key() {
        let args = vec![
            OscType::String("@min".to_string()),
            OscType::Float(0.0),
            OscType::String("@max".to_string()),
            OscType::Float(10.0),
        ];
        let atoms = parse_atoms(&args);
        assert_eq!(atoms.len(), 2);
        assert_eq!(atoms[0].prop, Prop::Min);
        assert_eq!(atoms[0].raw, vec![OscType::Float(0.0)]);
        assert_eq!(atoms[1].prop, Prop::Max);
    }

    #[test]
    fn parses_slot_scoped_keys() {
        let args = vec![
            OscType::String("@src.1@type".to_string()),
            OscType::Char('f'),
        ];
        let atoms = parse_atoms(&args);
        assert_eq!(atoms[0].scope, Scope::Src(1));
        assert_eq!(atoms[0].prop, Prop::Type);
    }

    #[test]
    fn add_remove_prefixes_recognized() {
        let args = vec![OscType::String("+@scope".to_string()), OscType::Int(5)];
        let atoms = parse_atoms(&args);
        assert_eq!(atoms[0].op, AtomOp::Add);
    }

    #[test]
    fn malformed_leading_token_is_skipped() {
        let args = vec![OscType::Int(1), OscType::String("@min".to_string()), OscType::Float(1.0)];
        let atoms = parse_atoms(&args);
        assert_eq!(atoms.len(), 1);
        assert_eq!(atoms[0].prop, Prop::Min);
    }
}
