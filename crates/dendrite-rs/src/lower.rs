//! Lowering from the high-level assignment graph to loop nests.

use anyhow::{anyhow, bail, Result};

use crate::hlir::{FetchOp, HlCode};
use crate::indexing::{AxisIndex, Projections, Symbol};
use crate::llir::{Binop, LlCode, LlExpr};
use crate::shape;
use crate::tensor::Tensor;

/// Wraps `body` in one loop per product-space dim, outermost first.
/// Dedicated axes keep their predeclared symbols and are not traced.
fn product_loops(projections: &Projections, body: LlCode) -> LlCode {
    let mut out = body;
    for (&extent, &sym) in projections
        .product_space
        .iter()
        .zip(projections.product_iterators.iter())
        .rev()
    {
        out = LlCode::For {
            index: sym,
            from: 0,
            to: extent as i64,
            body: Box::new(out),
            trace_it: sym.is_substitutable(),
        };
    }
    out
}

/// Finds the outermost dynamic provider among the rhs index arrays and wraps
/// the body in the corresponding dynamic-indices block.
fn wrap_dynamic(
    rhs: &[(Tensor, &[AxisIndex])],
    lhs_idcs: &[AxisIndex],
    body: LlCode,
) -> LlCode {
    for (tensor, idcs) in rhs {
        for idx in idcs.iter() {
            if let AxisIndex::DynamicProvider { idcs: provider_idcs, target_dims } = idx {
                // Recipients: every dynamic slot the statement consumes.
                let mut recipients = Vec::new();
                let mut note = |list: &[AxisIndex]| {
                    for i in list {
                        if let AxisIndex::DynamicRecipient(s) = i {
                            if !recipients.contains(s) {
                                recipients.push(*s);
                            }
                        }
                    }
                };
                note(lhs_idcs);
                for (_, other) in rhs {
                    note(other);
                }
                return LlCode::DynamicIndices {
                    tensor: *tensor,
                    tensor_idcs: provider_idcs.clone(),
                    dynamic_idcs: recipients,
                    target_dims: target_dims.clone(),
                    body: Box::new(body),
                    slice: None,
                };
            }
        }
    }
    body
}

/// A provider operand supplies indices, not values: its reads are replaced by
/// zero and the surviving accumulation argument carries the data.
fn operand_expr(tensor: Tensor, idcs: &[AxisIndex]) -> LlExpr {
    if idcs.iter().any(|i| matches!(i, AxisIndex::DynamicProvider { .. })) {
        LlExpr::Constant(0.0)
    } else {
        LlExpr::Get(tensor, idcs.to_vec())
    }
}

fn fill_loops(target: Tensor, value: impl Fn(&[AxisIndex]) -> LlExpr) -> Result<LlCode> {
    let dims = target.dims()?;
    let symbols: Vec<Symbol> = dims.iter().map(|_| Symbol::fresh()).collect();
    let idcs: Vec<AxisIndex> = symbols.iter().map(|s| AxisIndex::Iterator(*s)).collect();
    let mut body = LlCode::Set { tensor: target, idcs: idcs.clone(), value: value(&idcs) };
    for (&extent, &sym) in dims.iter().zip(symbols.iter()).rev() {
        body = LlCode::For {
            index: sym,
            from: 0,
            to: extent as i64,
            body: Box::new(body),
            trace_it: true,
        };
    }
    Ok(body)
}

/// Translates high-level code into loop nests.
pub fn to_low_level(code: &HlCode) -> Result<LlCode> {
    match code {
        HlCode::Noop => Ok(LlCode::Noop),
        // `Par` promises independence: lower through the rebalance
        // placeholder so a scheduler may split it later.
        HlCode::Par(a, b) => Ok(LlCode::Rebalance {
            label: None,
            children: vec![to_low_level(a)?, to_low_level(b)?],
        }),
        HlCode::ParHint(a, b) | HlCode::Seq(a, b) => {
            Ok(LlCode::lines(vec![to_low_level(a)?, to_low_level(b)?]))
        }
        HlCode::Block { comment, body } => {
            Ok(LlCode::lines(vec![LlCode::Comment(comment.clone()), to_low_level(body)?]))
        }
        HlCode::AccumBinop { zero_out, accum, op, lhs, rhs1, rhs2, step } => {
            let projections = shape::derive_projections(step).map_err(|e| anyhow!("{e}"))?;
            if projections.project_rhs.len() != 2 {
                bail!(
                    "binary accumulation against {} operand projections",
                    projections.project_rhs.len()
                );
            }
            lhs.set_value_distributes_over_sum(*accum == Binop::Add && *op == Binop::Mul);
            let lhs_idcs = projections.project_lhs.clone();
            let r1 = projections.project_rhs[0].as_slice();
            let r2 = projections.project_rhs[1].as_slice();
            let op_expr = LlExpr::Binop(
                *op,
                Box::new(operand_expr(*rhs1, r1)),
                Box::new(operand_expr(*rhs2, r2)),
            );
            // An overwrite accumulator has no use for the previous value;
            // fetching it would make every overwritten cell look recurrent.
            let value = match accum {
                Binop::Arg2 => op_expr,
                _ => LlExpr::Binop(
                    *accum,
                    Box::new(LlExpr::Get(*lhs, lhs_idcs.clone())),
                    Box::new(op_expr),
                ),
            };
            let set = LlCode::Set { tensor: *lhs, idcs: lhs_idcs.clone(), value };
            let body = wrap_dynamic(&[(*rhs1, r1), (*rhs2, r2)], &lhs_idcs, set);
            let loops = product_loops(&projections, body);
            if *zero_out {
                Ok(LlCode::lines(vec![LlCode::ZeroOut(*lhs), loops]))
            } else {
                Ok(loops)
            }
        }
        HlCode::AccumUnop { zero_out, accum, op, lhs, rhs, step } => {
            let projections = shape::derive_projections(step).map_err(|e| anyhow!("{e}"))?;
            if projections.project_rhs.len() != 1 {
                bail!(
                    "unary accumulation against {} operand projections",
                    projections.project_rhs.len()
                );
            }
            let lhs_idcs = projections.project_lhs.clone();
            let r = projections.project_rhs[0].as_slice();
            let op_expr = LlExpr::Unop(*op, Box::new(operand_expr(*rhs, r)));
            let value = match accum {
                Binop::Arg2 => op_expr,
                _ => LlExpr::Binop(
                    *accum,
                    Box::new(LlExpr::Get(*lhs, lhs_idcs.clone())),
                    Box::new(op_expr),
                ),
            };
            let set = LlCode::Set { tensor: *lhs, idcs: lhs_idcs.clone(), value };
            let body = wrap_dynamic(&[(*rhs, r)], &lhs_idcs, set);
            let loops = product_loops(&projections, body);
            if *zero_out {
                Ok(LlCode::lines(vec![LlCode::ZeroOut(*lhs), loops]))
            } else {
                Ok(loops)
            }
        }
        HlCode::Fetch { target, fetch } => match fetch {
            FetchOp::Constant(c) if *c == 0.0 => Ok(LlCode::ZeroOut(*target)),
            FetchOp::Constant(c) => fill_loops(*target, |_| LlExpr::Constant(*c)),
            FetchOp::Callback(f) => fill_loops(*target, |idcs| LlExpr::Synthetic {
                f: f.clone(),
                idcs: idcs.to_vec(),
            }),
            FetchOp::Synthetic(body) => to_low_level(body),
            FetchOp::Imported(name) => {
                bail!("imported fetch \"{name}\" is reserved and cannot be lowered")
            }
        },
    }
}

impl Tensor {
    pub(crate) fn set_value_distributes_over_sum(self, value: bool) {
        crate::tensor::with_node_mut(self, |n| n.value_distributes_over_sum = value);
    }
}
