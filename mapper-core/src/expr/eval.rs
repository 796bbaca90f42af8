//! Evaluates a compiled expression over input histories and an output
//! history (spec §4.6).

use super::ast::*;
use crate::time::MapperTime;
use crate::value::{Elem, History, Scalar, ScalarType, Vector};
use crate::value::coerce;
use std::collections::HashMap;

/// Result bitmask of one evaluation call (spec §4.6).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvalFlags(pub u8);

impl EvalFlags {
    pub const UPDATE: EvalFlags = EvalFlags(0b0001);
    pub const MUTED: EvalFlags = EvalFlags(0b0010);
    pub const RELEASE_BEFORE_UPDATE: EvalFlags = EvalFlags(0b0100);
    pub const RELEASE_AFTER_UPDATE: EvalFlags = EvalFlags(0b1000);
    pub const DONE: EvalFlags = EvalFlags(0b1_0000);

    pub fn contains(&self, other: EvalFlags) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn insert(&mut self, other: EvalFlags) {
        self.0 |= other.0;
    }
}

pub struct EvalOutput {
    pub flags: EvalFlags,
    pub value: Option<Vector>,
}

/// The per-source and per-destination histories an evaluation call reads
/// and writes. User-variable histories are owned by the caller (the local
/// slot, per spec §4.6) and reallocated whenever the compiled expression's
/// variable count grows.
pub struct EvalContext<'a> {
    pub src_histories: &'a [History],
    pub dst_history: &'a History,
    pub var_histories: &'a mut HashMap<String, History>,
}

/// An expression ready to run: the AST plus the sizing metadata computed
/// at compile time (spec §4.5 "Expression compilation").
#[derive(Clone, Debug)]
pub struct Evaluator {
    pub program: ExprProgram,
    pub num_sources: usize,
    pub dst_len: usize,
    pub dst_type: ScalarType,
    pub input_history_size: Vec<usize>,
    pub output_history_size: usize,
    pub user_variables: Vec<String>,
}

impl Evaluator {
    pub fn eval(&self, ctx: &mut EvalContext, now: MapperTime) -> EvalOutput {
        // Seed the output vector with the previous committed sample so a
        // partial (sliced) assignment leaves the rest untouched.
        let mut y: Vec<Option<f64>> = match ctx.dst_history.get(0) {
            Some((v, _)) => v.iter().map(|e| e.as_f64()).collect(),
            None => vec![None; self.dst_len],
        };
        if y.len() != self.dst_len {
            y.resize(self.dst_len, None);
        }

        let mut var_current: HashMap<String, f64> = HashMap::new();
        let mut flags = EvalFlags::DONE;
        let mut updated = false;
        let mut muted = false;

        for stmt in &self.program.statements {
            match stmt {
                Statement::Assign {
                    lhs: AssignLhs::Dst(idx),
                    rhs,
                } => {
                    let val = self.eval_expr(rhs, ctx, &var_current, now);
                    match (idx, val) {
                        (None, EvalValue::Vector(v)) => {
                            for (i, x) in v.into_iter().enumerate().take(self.dst_len) {
                                y[i] = Some(x);
                            }
                        }
                        (None, EvalValue::Scalar(s)) => {
                            for slot in y.iter_mut() {
                                *slot = Some(s);
                            }
                        }
                        (Some(IndexSpec::Single(i)), EvalValue::Scalar(s)) if *i < y.len() => {
                            y[*i] = Some(s);
                        }
                        (Some(IndexSpec::Range(a, b)), EvalValue::Vector(v)) => {
                            for (off, x) in v.into_iter().enumerate() {
                                let i = a + off;
                                if i <= *b && i < y.len() {
                                    y[i] = Some(x);
                                }
                            }
                        }
                        _ => {}
                    }
                    updated = true;
                }
                Statement::Assign {
                    lhs: AssignLhs::Var(name),
                    rhs,
                } => {
                    let val = self.eval_expr(rhs, ctx, &var_current, now);
                    let scalar = val.to_scalar();
                    var_current.insert(name.clone(), scalar);
                }
                Statement::Mute { cond } => {
                    let fire = match cond {
                        None => true,
                        Some(e) => self.eval_expr(e, ctx, &var_current, now).to_scalar() != 0.0,
                    };
                    if fire {
                        muted = true;
                    }
                }
                Statement::ReleaseBefore { cond } => {
                    let fire = match cond {
                        None => true,
                        Some(e) => self.eval_expr(e, ctx, &var_current, now).to_scalar() != 0.0,
                    };
                    if fire {
                        flags.insert(EvalFlags::RELEASE_BEFORE_UPDATE);
                    }
                }
                Statement::ReleaseAfter { cond } => {
                    let fire = match cond {
                        None => true,
                        Some(e) => self.eval_expr(e, ctx, &var_current, now).to_scalar() != 0.0,
                    };
                    if fire {
                        flags.insert(EvalFlags::RELEASE_AFTER_UPDATE);
                    }
                }
            }
        }

        // Commit user-variable histories so the next call's `{-k}` reads
        // see this evaluation's assignments.
        for (name, value) in &var_current {
            let hist = ctx
                .var_histories
                .entry(name.clone())
                .or_insert_with(|| History::new(1, 1));
            hist.push(vec![Elem::Val(Scalar::F64(*value))], now);
        }

        if muted {
            flags.insert(EvalFlags::MUTED);
        } else if updated {
            flags.insert(EvalFlags::UPDATE);
        }

        let value = if updated && !muted {
            Some(
                y.into_iter()
                    .map(|v| match v {
                        Some(x) => Elem::Val(coerce(self.dst_type, Scalar::F64(x))),
                        None => Elem::Null,
                    })
                    .collect(),
            )
        } else {
            None
        };

        EvalOutput { flags, value }
    }

    fn eval_expr(
        &self,
        e: &Expr,
        ctx: &EvalContext,
        var_current: &HashMap<String, f64>,
        now: MapperTime,
    ) -> EvalValue {
        let _ = now;
        match e {
            Expr::Num(n) => EvalValue::Scalar(*n),
            Expr::Src { index, hist } => {
                let h = ctx.src_histories.get(*index);
                match h.and_then(|h| h.get(*hist as usize)) {
                    Some((v, _)) => {
                        EvalValue::Vector(v.iter().map(|e| e.as_f64().unwrap_or(0.0)).collect())
                    }
                    None => EvalValue::Vector(vec![0.0]),
                }
            }
            // `y{-k}` (k >= 1 by construction, see ast::Expr::Dst) names the
            // destination's last *committed* sample k cycles back. The
            // backing `History` only gains that sample's entry once this
            // evaluation returns and the caller pushes it, so at read time
            // the most recent commit sits at `get(0)`, not `get(hist)`.
            Expr::Dst { hist } => match ctx.dst_history.get(hist.saturating_sub(1) as usize) {
                Some((v, _)) => {
                    EvalValue::Vector(v.iter().map(|e| e.as_f64().unwrap_or(0.0)).collect())
                }
                None => EvalValue::Vector(vec![0.0; self.dst_len]),
            },
            Expr::Var { name, hist } => {
                if *hist == 0 {
                    if let Some(v) = var_current.get(name) {
                        return EvalValue::Scalar(*v);
                    }
                }
                // Same one-cycle lag as `Dst` above: variable histories are
                // committed after the pass that computes them.
                match ctx.var_histories.get(name).and_then(|h| h.get(hist.saturating_sub(1) as usize)) {
                    Some((v, _)) => EvalValue::Scalar(v.first().and_then(|e| e.as_f64()).unwrap_or(0.0)),
                    None => EvalValue::Scalar(0.0),
                }
            }
            Expr::Index { base, idx } => {
                let v = self.eval_expr(base, ctx, var_current, now).to_vector();
                match idx {
                    IndexSpec::Single(i) => EvalValue::Scalar(*v.get(*i).unwrap_or(&0.0)),
                    IndexSpec::Range(a, b) => {
                        EvalValue::Vector(v.get(*a..=(*b).min(v.len().saturating_sub(1))).map(|s| s.to_vec()).unwrap_or_default())
                    }
                }
            }
            Expr::Unary { op, expr } => {
                let v = self.eval_expr(expr, ctx, var_current, now);
                match op {
                    UnOp::Neg => v.map_scalars(|x| -x),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval_expr(lhs, ctx, var_current, now);
                let r = self.eval_expr(rhs, ctx, var_current, now);
                EvalValue::zip(l, r, |a, b| match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => {
                        if b == 0.0 {
                            0.0
                        } else {
                            a / b
                        }
                    }
                })
            }
            Expr::Call { name, args } => self.eval_call(name, args, ctx, var_current, now),
        }
    }

    fn eval_call(
        &self,
        name: &str,
        args: &[Expr],
        ctx: &EvalContext,
        var_current: &HashMap<String, f64>,
        now: MapperTime,
    ) -> EvalValue {
        match name {
            "delay" if args.len() == 2 => {
                // delay(x, k) == x{-k}; only meaningful on a bare source
                // reference, so we re-dispatch through Expr::Src with the
                // literal offset.
                if let (Expr::Src { index, .. }, Expr::Num(k)) = (&args[0], &args[1]) {
                    return self.eval_expr(
                        &Expr::Src {
                            index: *index,
                            hist: *k as u32,
                        },
                        ctx,
                        var_current,
                        now,
                    );
                }
                self.eval_expr(&args[0], ctx, var_current, now)
            }
            "sum" | "mean" | "max" | "min" => {
                let vals: Vec<f64> = args
                    .iter()
                    .flat_map(|a| self.eval_expr(a, ctx, var_current, now).to_vector())
                    .collect();
                if vals.is_empty() {
                    return EvalValue::Scalar(0.0);
                }
                let r = match name {
                    "sum" => vals.iter().sum(),
                    "mean" => vals.iter().sum::<f64>() / vals.len() as f64,
                    "max" => vals.iter().cloned().fold(f64::MIN, f64::max),
                    _ => vals.iter().cloned().fold(f64::MAX, f64::min),
                };
                EvalValue::Scalar(r)
            }
            _ => EvalValue::Scalar(0.0),
        }
    }
}

enum EvalValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl EvalValue {
    fn to_vector(self) -> Vec<f64> {
        match self {
            EvalValue::Scalar(s) => vec![s],
            EvalValue::Vector(v) => v,
        }
    }

    fn to_scalar(&self) -> f64 {
        match self {
            EvalValue::Scalar(s) => *s,
            EvalValue::Vector(v) => v.first().copied().unwrap_or(0.0),
        }
    }

    fn map_scalars(self, f: impl Fn(f64) -> f64) -> EvalValue {
        match self {
            EvalValue::Scalar(s) => EvalValue::Scalar(f(s)),
            EvalValue::Vector(v) => EvalValue::Vector(v.into_iter().map(f).collect()),
        }
    }

    fn zip(l: EvalValue, r: EvalValue, f: impl Fn(f64, f64) -> f64) -> EvalValue {
        match (l, r) {
            (EvalValue::Scalar(a), EvalValue::Scalar(b)) => EvalValue::Scalar(f(a, b)),
            (EvalValue::Vector(a), EvalValue::Scalar(b)) => {
                EvalValue::Vector(a.into_iter().map(|x| f(x, b)).collect())
            }
            (EvalValue::Scalar(a), EvalValue::Vector(b)) => {
                EvalValue::Vector(b.into_iter().map(|x| f(a, x)).collect())
            }
            (EvalValue::Vector(a), EvalValue::Vector(b)) => {
                let n = a.len().min(b.len());
                EvalValue::Vector((0..n).map(|i| f(a[i], b[i])).collect())
            }
        }
    }
}
