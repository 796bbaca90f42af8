//! Expression compilation pipeline (spec §4.5/§4.6): parse or generate an
//! AST, size its history buffers, and hand back a ready-to-run `Evaluator`.

pub mod ast;
pub mod default;
pub mod eval;
pub mod parser;

pub use ast::{AssignLhs, BinOp, Expr, ExprProgram, IndexSpec, Statement, UnOp};
pub use default::SrcRange;
pub use eval::{EvalContext, EvalFlags, EvalOutput, Evaluator};

use crate::error::MapperError;
use crate::value::ScalarType;

/// Result of compiling an expression: the evaluator plus the history sizes
/// every source slot, the destination slot, and each user variable need to
/// allocate (spec §3 invariant 4).
pub struct Compiled {
    pub evaluator: Evaluator,
    pub input_history_size: Vec<usize>,
    pub output_history_size: usize,
    pub user_variables: Vec<String>,
}

/// Parse `src` and size it against `num_sources`/`dst_len`/`dst_type`.
pub fn compile(
    src: &str,
    num_sources: usize,
    dst_len: usize,
    dst_type: ScalarType,
) -> Result<Compiled, MapperError> {
    let program = parser::parse(src)?;
    from_program(program, num_sources, dst_len, dst_type)
}

/// Build the implicit (no expression given) program and compile it, per
/// spec §4.5's default-expression rules.
pub fn compile_default(
    num_sources: usize,
    src_len: usize,
    dst_len: usize,
    dst_type: ScalarType,
    linear: Option<(SrcRange, SrcRange)>,
) -> Result<Compiled, MapperError> {
    let program = match linear {
        Some((src_range, dst_range)) if num_sources == 1 => default::build_linear(src_range, dst_range),
        _ => default::build_identity_or_average(num_sources, src_len, dst_len),
    };
    from_program(program, num_sources, dst_len, dst_type)
}

fn from_program(
    program: ExprProgram,
    num_sources: usize,
    dst_len: usize,
    dst_type: ScalarType,
) -> Result<Compiled, MapperError> {
    let input_history_size: Vec<usize> = (0..num_sources)
        .map(|i| program.max_src_history(i) as usize + 1)
        .collect();
    let output_history_size = program.max_dst_history() as usize + 1;
    let user_variables = program.user_variable_names();

    let evaluator = Evaluator {
        program,
        num_sources,
        dst_len,
        dst_type,
        input_history_size: input_history_size.clone(),
        output_history_size,
        user_variables: user_variables.clone(),
    };

    Ok(Compiled {
        evaluator,
        input_history_size,
        output_history_size,
        user_variables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_sizes_history_from_offsets() {
        let compiled = compile("y=y{-2}*0.5+x", 1, 1, ScalarType::F64).unwrap();
        assert_eq!(compiled.output_history_size, 3);
        assert_eq!(compiled.input_history_size, vec![1]);
    }

    #[test]
    fn compile_default_identity() {
        let compiled = compile_default(1, 1, 1, ScalarType::F64, None).unwrap();
        assert_eq!(compiled.evaluator.program.statements.len(), 1);
    }
}
