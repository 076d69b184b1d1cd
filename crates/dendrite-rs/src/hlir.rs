//! The high-level IR: an assignment graph of accumulating operations over
//! projected index spaces.
//!
//! `Par` promises independence of its sides; `ParHint` admits overlap but
//! requires writes on the left to land before reads on the right; `Seq`
//! promises only fusion benefits. The distinctions are safety contracts for
//! schedulers; lowering is free to sequence all three.

use std::fmt;

use crate::llir::{Binop, SyntheticFn, Unop};
use crate::shape::UpdateStep;
use crate::tensor::Tensor;

/// How a fetched tensor obtains its value.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOp {
    Constant(f64),
    /// Nested code computing the target.
    Synthetic(Box<HlCode>),
    /// A host callback over the session step and cell indices.
    Callback(SyntheticFn),
    /// Reserved: fetch from a named external source.
    Imported(String),
}

/// High-level statements.
#[derive(Debug, Clone, PartialEq)]
pub enum HlCode {
    Noop,
    /// Independent composition.
    Par(Box<HlCode>, Box<HlCode>),
    /// Parallelizable with ordering of left writes before right reads.
    ParHint(Box<HlCode>, Box<HlCode>),
    /// Sequential composition.
    Seq(Box<HlCode>, Box<HlCode>),
    /// Attaches a label that propagates into generated code.
    Block { comment: String, body: Box<HlCode> },
    /// `lhs := accum(lhs, op(rhs1, rhs2))` over the step's projections.
    AccumBinop {
        zero_out: bool,
        accum: Binop,
        op: Binop,
        lhs: Tensor,
        rhs1: Tensor,
        rhs2: Tensor,
        step: UpdateStep,
    },
    /// `lhs := accum(lhs, op(rhs))` over the step's projections.
    AccumUnop {
        zero_out: bool,
        accum: Binop,
        op: Unop,
        lhs: Tensor,
        rhs: Tensor,
        step: UpdateStep,
    },
    Fetch { target: Tensor, fetch: FetchOp },
}

impl HlCode {
    pub fn block(comment: &str, body: HlCode) -> HlCode {
        HlCode::Block { comment: comment.to_string(), body: Box::new(body) }
    }
}

/// Right fold into `Seq`.
pub fn sequential(items: Vec<HlCode>) -> HlCode {
    let mut items: Vec<HlCode> = items.into_iter().filter(|c| *c != HlCode::Noop).collect();
    match items.len() {
        0 => HlCode::Noop,
        1 => items.pop().unwrap(),
        _ => {
            let mut acc = items.pop().unwrap();
            while let Some(item) = items.pop() {
                acc = HlCode::Seq(Box::new(item), Box::new(acc));
            }
            acc
        }
    }
}

/// Right fold into `Par`.
pub fn all_parallel(items: Vec<HlCode>) -> HlCode {
    let mut items: Vec<HlCode> = items.into_iter().filter(|c| *c != HlCode::Noop).collect();
    match items.len() {
        0 => HlCode::Noop,
        1 => items.pop().unwrap(),
        _ => {
            let mut acc = items.pop().unwrap();
            while let Some(item) = items.pop() {
                acc = HlCode::Par(Box::new(item), Box::new(acc));
            }
            acc
        }
    }
}

/// Flattens nested `Par` (and `ParHint` when `force_hints`) into a list.
pub fn flat_parallel(force_hints: bool, code: &HlCode) -> Vec<HlCode> {
    let mut out = Vec::new();
    fn go(code: &HlCode, force_hints: bool, out: &mut Vec<HlCode>) {
        match code {
            HlCode::Noop => {}
            HlCode::Par(a, b) => {
                go(a, force_hints, out);
                go(b, force_hints, out);
            }
            HlCode::ParHint(a, b) if force_hints => {
                go(a, force_hints, out);
                go(b, force_hints, out);
            }
            other => out.push(other.clone()),
        }
    }
    go(code, force_hints, &mut out);
    out
}

/// Drops any accumulating assignment whose left-hand side is `tensor`.
/// Used to strip initialization-only assignments.
pub fn remove_updates(tensor: Tensor, code: HlCode) -> HlCode {
    match code {
        HlCode::AccumBinop { lhs, .. } | HlCode::AccumUnop { lhs, .. } if lhs == tensor => {
            HlCode::Noop
        }
        HlCode::Par(a, b) => HlCode::Par(
            Box::new(remove_updates(tensor, *a)),
            Box::new(remove_updates(tensor, *b)),
        ),
        HlCode::ParHint(a, b) => HlCode::ParHint(
            Box::new(remove_updates(tensor, *a)),
            Box::new(remove_updates(tensor, *b)),
        ),
        HlCode::Seq(a, b) => HlCode::Seq(
            Box::new(remove_updates(tensor, *a)),
            Box::new(remove_updates(tensor, *b)),
        ),
        HlCode::Block { comment, body } => {
            HlCode::Block { comment, body: Box::new(remove_updates(tensor, *body)) }
        }
        other => other,
    }
}

fn sexp(code: &HlCode, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    match code {
        HlCode::Noop => writeln!(f, "{pad}(noop)"),
        HlCode::Par(a, b) => {
            writeln!(f, "{pad}(par")?;
            sexp(a, f, indent + 1)?;
            sexp(b, f, indent + 1)?;
            writeln!(f, "{pad})")
        }
        HlCode::ParHint(a, b) => {
            writeln!(f, "{pad}(par-hint")?;
            sexp(a, f, indent + 1)?;
            sexp(b, f, indent + 1)?;
            writeln!(f, "{pad})")
        }
        HlCode::Seq(a, b) => {
            writeln!(f, "{pad}(seq")?;
            sexp(a, f, indent + 1)?;
            sexp(b, f, indent + 1)?;
            writeln!(f, "{pad})")
        }
        HlCode::Block { comment, body } => {
            writeln!(f, "{pad}(block \"{comment}\"")?;
            sexp(body, f, indent + 1)?;
            writeln!(f, "{pad})")
        }
        HlCode::AccumBinop { zero_out, accum, op, lhs, rhs1, rhs2, .. } => {
            let zero = if *zero_out { " :zero-out" } else { "" };
            writeln!(
                f,
                "{pad}(accum-binop{zero} {} {} t{} t{} t{})",
                accum.name(),
                op.name(),
                lhs.0,
                rhs1.0,
                rhs2.0
            )
        }
        HlCode::AccumUnop { zero_out, accum, op, lhs, rhs, .. } => {
            let zero = if *zero_out { " :zero-out" } else { "" };
            writeln!(
                f,
                "{pad}(accum-unop{zero} {} {} t{} t{})",
                accum.name(),
                op.name(),
                lhs.0,
                rhs.0
            )
        }
        HlCode::Fetch { target, fetch } => match fetch {
            FetchOp::Constant(c) => writeln!(f, "{pad}(fetch t{} (constant {c}))", target.0),
            FetchOp::Callback(cb) => {
                writeln!(f, "{pad}(fetch t{} (callback {}))", target.0, cb.name)
            }
            FetchOp::Imported(name) => {
                writeln!(f, "{pad}(fetch t{} (imported \"{name}\"))", target.0)
            }
            FetchOp::Synthetic(body) => {
                writeln!(f, "{pad}(fetch t{} (synthetic", target.0)?;
                sexp(body, f, indent + 1)?;
                writeln!(f, "{pad}))")
            }
        },
    }
}

impl fmt::Display for HlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        sexp(self, f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_folds_and_drops_noops() {
        assert_eq!(sequential(vec![]), HlCode::Noop);
        assert_eq!(sequential(vec![HlCode::Noop, HlCode::Noop]), HlCode::Noop);
        let a = HlCode::block("a", HlCode::Noop);
        assert_eq!(sequential(vec![a.clone(), HlCode::Noop]), a);
    }

    #[test]
    fn flat_parallel_flattens_hints_only_when_forced() {
        let a = HlCode::block("a", HlCode::Noop);
        let b = HlCode::block("b", HlCode::Noop);
        let c = HlCode::block("c", HlCode::Noop);
        let code = HlCode::Par(
            Box::new(a.clone()),
            Box::new(HlCode::ParHint(Box::new(b.clone()), Box::new(c.clone()))),
        );
        assert_eq!(flat_parallel(false, &code).len(), 2);
        assert_eq!(flat_parallel(true, &code), vec![a, b, c]);
    }
}
