//! Hand-written lexer and recursive-descent parser for the expression
//! subset described in spec §4.6 (grounded on the teacher's
//! `compiler/parser.rs` shape — tokenize, then descend by precedence —
//! applied to an arithmetic grammar instead of BPMN XML).

use super::ast::*;
use crate::error::MapperError;

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Colon,
    Comma,
    Semicolon,
}

fn lex(src: &str) -> Result<Vec<Tok>, MapperError> {
    let mut toks = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            '=' => {
                toks.push(Tok::Eq);
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '[' => {
                toks.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                toks.push(Tok::RBracket);
                i += 1;
            }
            '{' => {
                toks.push(Tok::LBrace);
                i += 1;
            }
            '}' => {
                toks.push(Tok::RBrace);
                i += 1;
            }
            ':' => {
                toks.push(Tok::Colon);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            ';' => {
                toks.push(Tok::Semicolon);
                i += 1;
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                let n = s
                    .parse::<f64>()
                    .map_err(|_| MapperError::ExpressionCompile(format!("bad number '{s}'")))?;
                toks.push(Tok::Num(n));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                toks.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(MapperError::ExpressionCompile(format!(
                    "unexpected character '{other}'"
                )))
            }
        }
    }
    Ok(toks)
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

type PResult<T> = Result<T, MapperError>;

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, t: Tok) -> PResult<()> {
        match self.next() {
            Some(ref got) if *got == t => Ok(()),
            got => Err(MapperError::ExpressionCompile(format!(
                "expected {t:?}, got {got:?}"
            ))),
        }
    }

    fn parse_program(&mut self) -> PResult<ExprProgram> {
        let mut statements = Vec::new();
        loop {
            while matches!(self.peek(), Some(Tok::Semicolon)) {
                self.pos += 1;
            }
            if self.peek().is_none() {
                break;
            }
            statements.push(self.parse_statement()?);
            if !matches!(self.peek(), Some(Tok::Semicolon)) {
                break;
            }
        }
        Ok(ExprProgram { statements })
    }

    fn parse_statement(&mut self) -> PResult<Statement> {
        if let Some(Tok::Ident(name)) = self.peek().cloned() {
            if (name == "mute" || name == "release") && self.toks.get(self.pos + 1) == Some(&Tok::LParen) {
                self.pos += 2;
                let cond = if matches!(self.peek(), Some(Tok::RParen)) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(Tok::RParen)?;
                return Ok(match name.as_str() {
                    "mute" => Statement::Mute { cond },
                    _ => Statement::ReleaseAfter { cond },
                });
            }
            if name == "release_before" && self.toks.get(self.pos + 1) == Some(&Tok::LParen) {
                self.pos += 2;
                let cond = if matches!(self.peek(), Some(Tok::RParen)) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(Tok::RParen)?;
                return Ok(Statement::ReleaseBefore { cond });
            }
        }

        let lhs = self.parse_lhs()?;
        self.expect(Tok::Eq)?;
        let rhs = self.parse_expr()?;
        Ok(Statement::Assign { lhs, rhs })
    }

    fn parse_lhs(&mut self) -> PResult<AssignLhs> {
        match self.next() {
            Some(Tok::Ident(name)) if name == "y" => {
                if matches!(self.peek(), Some(Tok::LBracket)) {
                    self.pos += 1;
                    let idx = self.parse_index_spec()?;
                    self.expect(Tok::RBracket)?;
                    Ok(AssignLhs::Dst(Some(idx)))
                } else {
                    Ok(AssignLhs::Dst(None))
                }
            }
            Some(Tok::Ident(name)) => Ok(AssignLhs::Var(name)),
            got => Err(MapperError::ExpressionCompile(format!(
                "expected assignment target, got {got:?}"
            ))),
        }
    }

    fn parse_index_spec(&mut self) -> PResult<IndexSpec> {
        let a = self.parse_uint()?;
        if matches!(self.peek(), Some(Tok::Colon)) {
            self.pos += 1;
            let b = self.parse_uint()?;
            Ok(IndexSpec::Range(a, b))
        } else {
            Ok(IndexSpec::Single(a))
        }
    }

    fn parse_uint(&mut self) -> PResult<usize> {
        match self.next() {
            Some(Tok::Num(n)) if n >= 0.0 => Ok(n as usize),
            got => Err(MapperError::ExpressionCompile(format!(
                "expected index, got {got:?}"
            ))),
        }
    }

    // expr := term (('+' | '-') term)*
    fn parse_expr(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Tok::Plus) => {
                    self.pos += 1;
                    let rhs = self.parse_term()?;
                    lhs = Expr::Binary {
                        op: BinOp::Add,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                }
                Some(Tok::Minus) => {
                    self.pos += 1;
                    let rhs = self.parse_term()?;
                    lhs = Expr::Binary {
                        op: BinOp::Sub,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    // term := unary (('*' | '/') unary)*
    fn parse_term(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Tok::Star) => {
                    self.pos += 1;
                    let rhs = self.parse_unary()?;
                    lhs = Expr::Binary {
                        op: BinOp::Mul,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                }
                Some(Tok::Slash) => {
                    self.pos += 1;
                    let rhs = self.parse_unary()?;
                    lhs = Expr::Binary {
                        op: BinOp::Div,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        if matches!(self.peek(), Some(Tok::Minus)) {
            self.pos += 1;
            let e = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                expr: Box::new(e),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut base = self.parse_atom()?;
        loop {
            match self.peek() {
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    let idx = self.parse_index_spec()?;
                    self.expect(Tok::RBracket)?;
                    base = Expr::Index {
                        base: Box::new(base),
                        idx,
                    };
                }
                _ => break,
            }
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> PResult<Expr> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::LParen) => {
                let e = self.parse_expr()?;
                self.expect(Tok::RParen)?;
                Ok(e)
            }
            Some(Tok::Ident(name)) => self.parse_ident_atom(name),
            got => Err(MapperError::ExpressionCompile(format!(
                "unexpected token {got:?}"
            ))),
        }
    }

    fn parse_ident_atom(&mut self, name: String) -> PResult<Expr> {
        if matches!(self.peek(), Some(Tok::LParen)) {
            self.pos += 1;
            let mut args = Vec::new();
            if !matches!(self.peek(), Some(Tok::RParen)) {
                args.push(self.parse_expr()?);
                while matches!(self.peek(), Some(Tok::Comma)) {
                    self.pos += 1;
                    args.push(self.parse_expr()?);
                }
            }
            self.expect(Tok::RParen)?;
            return Ok(Expr::Call { name, args });
        }

        let hist = if matches!(self.peek(), Some(Tok::LBrace)) {
            self.pos += 1;
            let h = self.parse_history_offset()?;
            self.expect(Tok::RBrace)?;
            h
        } else {
            0
        };

        if name == "y" {
            return Ok(Expr::Dst { hist });
        }
        if name == "x" {
            return Ok(Expr::Src { index: 0, hist });
        }
        if let Some(rest) = name.strip_prefix('x') {
            if let Ok(idx) = rest.parse::<usize>() {
                return Ok(Expr::Src { index: idx, hist });
            }
        }
        Ok(Expr::Var { name, hist })
    }

    /// `{-k}`: only non-positive offsets are meaningful (spec §4.6: `0` is
    /// current, negative is past).
    fn parse_history_offset(&mut self) -> PResult<u32> {
        let neg = matches!(self.peek(), Some(Tok::Minus));
        if neg {
            self.pos += 1;
        }
        match self.next() {
            Some(Tok::Num(n)) => Ok(n as u32),
            got => Err(MapperError::ExpressionCompile(format!(
                "expected history offset, got {got:?}"
            ))),
        }
    }
}

/// Parse an expression string into its AST (spec §4.5 "compiled token
/// stream"). Does not itself check it against signal signatures — that is
/// `expr::compile`'s job.
pub fn parse(src: &str) -> Result<ExprProgram, MapperError> {
    let toks = lex(src)?;
    let mut p = Parser { toks, pos: 0 };
    let prog = p.parse_program()?;
    if p.pos != p.toks.len() {
        return Err(MapperError::ExpressionCompile(
            "trailing tokens after expression".to_string(),
        ));
    }
    Ok(prog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identity() {
        let prog = parse("y=x").unwrap();
        assert_eq!(prog.statements.len(), 1);
    }

    #[test]
    fn parses_iir_filter() {
        let prog = parse("y=y{-1}*0.9+x*0.1").unwrap();
        assert_eq!(prog.max_dst_history(), 1);
    }

    #[test]
    fn parses_convergent_average() {
        let prog = parse("y=(x0+x1)/2").unwrap();
        assert_eq!(prog.statements.len(), 1);
    }

    #[test]
    fn parses_mute_statement() {
        let prog = parse("y=x; mute(x[0])").unwrap();
        assert_eq!(prog.statements.len(), 2);
    }
}
