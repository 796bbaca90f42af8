//! Expression AST — the "compiled token stream" the evaluator walks.
//!
//! The text grammar itself is a small, self-contained subset of the
//! language described in spec §4.6/§6.1 Glossary (`x`, `x{-k}`, `y`,
//! `y{-k}`, user variables, vector indices/slices, a handful of
//! reductions, `delay()`, and `mute()`/`release()` pseudo-assignments).
//! The exact reference-implementation grammar is explicitly out of scope
//! (spec §1) — this module only needs to satisfy the compile contract.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexSpec {
    Single(usize),
    Range(usize, usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Num(f64),
    /// `x` (index 0) or `x0`..`xN-1` for a convergent map; `hist` is the
    /// non-negative history offset parsed out of a trailing `{-k}`.
    Src { index: usize, hist: u32 },
    /// `y{-k}`, `k >= 1` (referencing `y` with no offset is a parse error:
    /// the current output cannot reference itself).
    Dst { hist: u32 },
    /// A user variable, optionally historied (`v{-1}`). Initial type is
    /// always `f64` (spec §4.6); position starts empty.
    Var { name: String, hist: u32 },
    Index {
        base: Box<Expr>,
        idx: IndexSpec,
    },
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `sum(...)`, `mean(...)`, `max(...)`, `min(...)`, `delay(x, k)`.
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum AssignLhs {
    /// `y` or `y[a:b]`.
    Dst(Option<IndexSpec>),
    /// A user-variable assignment, e.g. `myvar = myvar + 1`.
    Var(String),
}

/// One line of a compiled expression (statements run in textual order per
/// update, spec §4.6). The `mute`/`release` forms are the boundary-action
/// signalling hooks: an optional guard expression (nonzero = fire).
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    Assign { lhs: AssignLhs, rhs: Expr },
    Mute { cond: Option<Expr> },
    ReleaseBefore { cond: Option<Expr> },
    ReleaseAfter { cond: Option<Expr> },
}

/// A full compiled expression: a sequence of statements executed in order
/// per update (spec §4.6 evaluation semantics).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExprProgram {
    pub statements: Vec<Statement>,
}

impl ExprProgram {
    fn each_expr(&self, mut f: impl FnMut(&Expr)) {
        for stmt in &self.statements {
            match stmt {
                Statement::Assign { rhs, .. } => walk_expr(rhs, &mut f),
                Statement::Mute { cond }
                | Statement::ReleaseBefore { cond }
                | Statement::ReleaseAfter { cond } => {
                    if let Some(c) = cond {
                        walk_expr(c, &mut f);
                    }
                }
            }
        }
    }

    /// Maximum (most negative) history offset referenced against source
    /// `index`, used to size that source slot's history buffer (spec §3
    /// invariant 4).
    pub fn max_src_history(&self, index: usize) -> u32 {
        let mut max = 0;
        self.each_expr(|e| {
            if let Expr::Src { index: i, hist } = e {
                if *i == index {
                    max = max.max(*hist);
                }
            }
        });
        max
    }

    pub fn max_dst_history(&self) -> u32 {
        let mut max = 0;
        self.each_expr(|e| {
            if let Expr::Dst { hist } = e {
                max = max.max(*hist);
            }
        });
        max
    }

    pub fn references_dst_history(&self) -> bool {
        self.max_dst_history() > 0
    }

    pub fn user_variable_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for stmt in &self.statements {
            if let Statement::Assign {
                lhs: AssignLhs::Var(n),
                ..
            } = stmt
            {
                if !names.contains(n) {
                    names.push(n.clone());
                }
            }
        }
        self.each_expr(|e| {
            if let Expr::Var { name, .. } = e {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        });
        names
    }
}

fn walk_expr(e: &Expr, f: &mut impl FnMut(&Expr)) {
    f(e);
    match e {
        Expr::Index { base, .. } => walk_expr(base, f),
        Expr::Unary { expr, .. } => walk_expr(expr, f),
        Expr::Binary { lhs, rhs, .. } => {
            walk_expr(lhs, f);
            walk_expr(rhs, f);
        }
        Expr::Call { args, .. } => {
            for a in args {
                walk_expr(a, f);
            }
        }
        Expr::Num(_) | Expr::Src { .. } | Expr::Dst { .. } | Expr::Var { .. } => {}
    }
}
