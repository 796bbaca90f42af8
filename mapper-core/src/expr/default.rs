//! Builds the implicit expression used when a map is created without one
//! (spec §4.5 "Default expressions").
//!
//! These trees are constructed directly rather than round-tripped through
//! the text parser, since the generation rules (especially the linear
//! calibration case) need exact per-element scale/offset constants that
//! the grammar has no literal syntax for beyond what `f64` already gives.

use super::ast::*;

/// A source's range, when both `min` and `max` properties are known.
#[derive(Clone, Copy, Debug)]
pub struct SrcRange {
    pub min: f64,
    pub max: f64,
}

/// Build `y = x` / `y = x[0:dst_len-1]` / `y[0:src_len-1] = x` for a single
/// source, or the convergent average for multiple sources, per spec §4.5.
pub fn build_identity_or_average(num_sources: usize, src_len: usize, dst_len: usize) -> ExprProgram {
    if num_sources <= 1 {
        let rhs = if src_len == dst_len {
            Expr::Src { index: 0, hist: 0 }
        } else if src_len > dst_len {
            Expr::Index {
                base: Box::new(Expr::Src { index: 0, hist: 0 }),
                idx: IndexSpec::Range(0, dst_len.saturating_sub(1)),
            }
        } else {
            Expr::Src { index: 0, hist: 0 }
        };
        let lhs = if src_len < dst_len {
            AssignLhs::Dst(Some(IndexSpec::Range(0, src_len.saturating_sub(1))))
        } else {
            AssignLhs::Dst(None)
        };
        return ExprProgram {
            statements: vec![Statement::Assign { lhs, rhs }],
        };
    }

    // Convergent: y[0:min_len-1] = (x0 + x1 + ... + xN-1) / N
    let min_len = dst_len.min(src_len);
    let mut sum = Expr::Src { index: 0, hist: 0 };
    for i in 1..num_sources {
        sum = Expr::Binary {
            op: BinOp::Add,
            lhs: Box::new(sum),
            rhs: Box::new(Expr::Src { index: i, hist: 0 }),
        };
    }
    let rhs = Expr::Binary {
        op: BinOp::Div,
        lhs: Box::new(sum),
        rhs: Box::new(Expr::Num(num_sources as f64)),
    };
    ExprProgram {
        statements: vec![Statement::Assign {
            lhs: AssignLhs::Dst(Some(IndexSpec::Range(0, min_len.saturating_sub(1)))),
            rhs,
        }],
    }
}

/// Build the linear-calibration expression `y = x * scale + offset`
/// (spec §4.5), given one source's known range and the destination's known
/// range. Falls back to the identity/average form if either range is
/// unknown or degenerate per element.
///
/// `src_min == src_max` collapses to the constant `dst_min`; a source range
/// equal to the destination range collapses to `y = x`.
pub fn build_linear(src: SrcRange, dst: SrcRange) -> ExprProgram {
    if src.min == src.max {
        return ExprProgram {
            statements: vec![Statement::Assign {
                lhs: AssignLhs::Dst(None),
                rhs: Expr::Num(dst.min),
            }],
        };
    }
    if src.min == dst.min && src.max == dst.max {
        return ExprProgram {
            statements: vec![Statement::Assign {
                lhs: AssignLhs::Dst(None),
                rhs: Expr::Src { index: 0, hist: 0 },
            }],
        };
    }

    let scale = (dst.max - dst.min) / (src.max - src.min);
    let offset = (dst.max * src.min - dst.min * src.max) / (src.min - src.max);

    let rhs = Expr::Binary {
        op: BinOp::Add,
        lhs: Box::new(Expr::Binary {
            op: BinOp::Mul,
            lhs: Box::new(Expr::Src { index: 0, hist: 0 }),
            rhs: Box::new(Expr::Num(scale)),
        }),
        rhs: Box::new(Expr::Num(offset)),
    };
    ExprProgram {
        statements: vec![Statement::Assign {
            lhs: AssignLhs::Dst(None),
            rhs,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_for_equal_lengths() {
        let prog = build_identity_or_average(1, 3, 3);
        assert_eq!(prog.statements.len(), 1);
        match &prog.statements[0] {
            Statement::Assign { lhs: AssignLhs::Dst(None), rhs: Expr::Src { index: 0, hist: 0 } } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncates_when_source_longer() {
        let prog = build_identity_or_average(1, 5, 2);
        match &prog.statements[0] {
            Statement::Assign {
                lhs: AssignLhs::Dst(None),
                rhs: Expr::Index { idx: IndexSpec::Range(0, 1), .. },
            } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pads_when_source_shorter() {
        let prog = build_identity_or_average(1, 2, 5);
        match &prog.statements[0] {
            Statement::Assign {
                lhs: AssignLhs::Dst(Some(IndexSpec::Range(0, 1))),
                ..
            } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn convergent_average_divides_by_source_count() {
        let prog = build_identity_or_average(3, 1, 1);
        match &prog.statements[0] {
            Statement::Assign {
                rhs: Expr::Binary { op: BinOp::Div, rhs, .. },
                ..
            } => assert_eq!(**rhs, Expr::Num(3.0)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn linear_calibration_matches_formula() {
        let prog = build_linear(SrcRange { min: 0.0, max: 1.0 }, SrcRange { min: 0.0, max: 100.0 });
        match &prog.statements[0] {
            Statement::Assign {
                rhs: Expr::Binary { op: BinOp::Add, lhs, rhs },
                ..
            } => {
                if let Expr::Binary { op: BinOp::Mul, rhs: scale, .. } = lhs.as_ref() {
                    assert_eq!(**scale, Expr::Num(100.0));
                } else {
                    panic!("expected scale term");
                }
                assert_eq!(**rhs, Expr::Num(0.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn degenerate_source_range_is_constant() {
        let prog = build_linear(SrcRange { min: 5.0, max: 5.0 }, SrcRange { min: 0.0, max: 1.0 });
        match &prog.statements[0] {
            Statement::Assign { rhs: Expr::Num(n), .. } => assert_eq!(*n, 0.0),
            other => panic!("unexpected {other:?}"),
        }
    }
}
