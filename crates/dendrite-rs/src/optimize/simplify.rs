//! Algebraic simplification of the float sub-IR, applied to a fixpoint.
//!
//! Rewrites preserve the sequence of observable assignments to non-virtual
//! tensors; only pure expressions and trivial scopes are restructured.

use crate::llir::{Binop, LlCode, LlExpr, ScopeId, Unop};

use super::OptimizeSettings;

fn constant_of(expr: &LlExpr) -> Option<f64> {
    match expr {
        LlExpr::Constant(c) => Some(*c),
        _ => None,
    }
}

/// Substitutes `GetLocal(id)` by `replacement` within an expression,
/// stopping at inner scopes that rebind the same id.
fn subst_local(expr: &LlExpr, id: ScopeId, replacement: &LlExpr) -> LlExpr {
    match expr {
        LlExpr::GetLocal(at) if *at == id => replacement.clone(),
        LlExpr::LocalScope { id: inner, .. } if *inner == id => expr.clone(),
        LlExpr::LocalScope { id: inner, precision, body, orig_indices } => LlExpr::LocalScope {
            id: *inner,
            precision: *precision,
            body: Box::new(subst_local_code(body, id, replacement)),
            orig_indices: orig_indices.clone(),
        },
        LlExpr::Binop(op, a, b) => LlExpr::Binop(
            *op,
            Box::new(subst_local(a, id, replacement)),
            Box::new(subst_local(b, id, replacement)),
        ),
        LlExpr::Unop(op, a) => LlExpr::Unop(*op, Box::new(subst_local(a, id, replacement))),
        other => other.clone(),
    }
}

fn subst_local_code(code: &LlCode, id: ScopeId, replacement: &LlExpr) -> LlCode {
    match code {
        LlCode::Lines(items) => {
            LlCode::Lines(items.iter().map(|c| subst_local_code(c, id, replacement)).collect())
        }
        LlCode::For { index, from, to, body, trace_it } => LlCode::For {
            index: *index,
            from: *from,
            to: *to,
            body: Box::new(subst_local_code(body, id, replacement)),
            trace_it: *trace_it,
        },
        LlCode::Set { tensor, idcs, value } => LlCode::Set {
            tensor: *tensor,
            idcs: idcs.clone(),
            value: subst_local(value, id, replacement),
        },
        LlCode::SetLocal(at, value) => LlCode::SetLocal(*at, subst_local(value, id, replacement)),
        other => other.clone(),
    }
}

/// Unrolls an integer power into a product chain; negative exponents become
/// the reciprocal via a `-1` power of the chain.
fn unroll_pow(base: &LlExpr, exponent: f64) -> Option<LlExpr> {
    if exponent.fract() != 0.0 || exponent.abs() > 16.0 {
        return None;
    }
    let n = exponent.abs() as u32;
    let unrolled = match n {
        0 => LlExpr::Constant(1.0),
        _ => {
            let mut acc = base.clone();
            for _ in 1..n {
                acc = LlExpr::Binop(Binop::Mul, Box::new(acc), Box::new(base.clone()));
            }
            acc
        }
    };
    if exponent < 0.0 {
        Some(LlExpr::Binop(
            Binop::ToPowOf,
            Box::new(unrolled),
            Box::new(LlExpr::Constant(-1.0)),
        ))
    } else {
        Some(unrolled)
    }
}

fn simplify_expr(settings: &OptimizeSettings, expr: &LlExpr) -> LlExpr {
    match expr {
        LlExpr::Constant(_) | LlExpr::Get(_, _) | LlExpr::GetLocal(_) | LlExpr::GetGlobal(_) => {
            expr.clone()
        }
        LlExpr::Synthetic { .. } => expr.clone(),
        LlExpr::LocalScope { id, precision, body, orig_indices } => {
            let body = simplify_code(settings, body);
            match &body {
                // Trivial scope elision: a single write of the local.
                LlCode::SetLocal(at, v) if at == id => v.clone(),
                // Two writes: substitute the first into the second and lift.
                LlCode::Lines(items) => {
                    if let [LlCode::SetLocal(a1, v1), LlCode::SetLocal(a2, v2)] = items.as_slice() {
                        if a1 == id && a2 == id {
                            return simplify_expr(settings, &subst_local(v2, *id, v1));
                        }
                    }
                    LlExpr::LocalScope {
                        id: *id,
                        precision: *precision,
                        body: Box::new(body),
                        orig_indices: orig_indices.clone(),
                    }
                }
                _ => LlExpr::LocalScope {
                    id: *id,
                    precision: *precision,
                    body: Box::new(body),
                    orig_indices: orig_indices.clone(),
                },
            }
        }
        LlExpr::Unop(Unop::Identity, a) => simplify_expr(settings, a),
        LlExpr::Unop(op, a) => {
            let a = simplify_expr(settings, a);
            match constant_of(&a) {
                Some(c) => LlExpr::Constant(op.eval(c)),
                None => LlExpr::Unop(*op, Box::new(a)),
            }
        }
        LlExpr::Binop(Binop::Arg1, a, _) => simplify_expr(settings, a),
        LlExpr::Binop(Binop::Arg2, _, b) => simplify_expr(settings, b),
        LlExpr::Binop(op, a, b) => {
            let a = simplify_expr(settings, a);
            let b = simplify_expr(settings, b);
            let ca = constant_of(&a);
            let cb = constant_of(&b);
            if let (Some(x), Some(y)) = (ca, cb) {
                return LlExpr::Constant(op.eval(x, y));
            }
            match op {
                Binop::Add => {
                    if cb == Some(0.0) {
                        return a;
                    }
                    if ca == Some(0.0) {
                        return b;
                    }
                    // Reassociate nested constants: c1 + (c2 + x) = (c1+c2) + x.
                    if let (Some(c1), LlExpr::Binop(Binop::Add, ba, bb)) = (ca, &b) {
                        if let Some(c2) = constant_of(ba) {
                            return LlExpr::Binop(
                                Binop::Add,
                                Box::new(LlExpr::Constant(c1 + c2)),
                                bb.clone(),
                            );
                        }
                        if let Some(c2) = constant_of(bb) {
                            return LlExpr::Binop(
                                Binop::Add,
                                Box::new(LlExpr::Constant(c1 + c2)),
                                ba.clone(),
                            );
                        }
                    }
                    if let (LlExpr::Binop(Binop::Add, aa, ab), Some(c1)) = (&a, cb) {
                        if let Some(c2) = constant_of(aa) {
                            return LlExpr::Binop(
                                Binop::Add,
                                Box::new(LlExpr::Constant(c1 + c2)),
                                ab.clone(),
                            );
                        }
                        if let Some(c2) = constant_of(ab) {
                            return LlExpr::Binop(
                                Binop::Add,
                                Box::new(LlExpr::Constant(c1 + c2)),
                                aa.clone(),
                            );
                        }
                    }
                    LlExpr::Binop(Binop::Add, Box::new(a), Box::new(b))
                }
                Binop::Mul => {
                    if cb == Some(1.0) {
                        return a;
                    }
                    if ca == Some(1.0) {
                        return b;
                    }
                    if let (Some(c1), LlExpr::Binop(Binop::Mul, ba, bb)) = (ca, &b) {
                        if let Some(c2) = constant_of(ba) {
                            return LlExpr::Binop(
                                Binop::Mul,
                                Box::new(LlExpr::Constant(c1 * c2)),
                                bb.clone(),
                            );
                        }
                        if let Some(c2) = constant_of(bb) {
                            return LlExpr::Binop(
                                Binop::Mul,
                                Box::new(LlExpr::Constant(c1 * c2)),
                                ba.clone(),
                            );
                        }
                    }
                    if let (LlExpr::Binop(Binop::Mul, aa, ab), Some(c1)) = (&a, cb) {
                        if let Some(c2) = constant_of(aa) {
                            return LlExpr::Binop(
                                Binop::Mul,
                                Box::new(LlExpr::Constant(c1 * c2)),
                                ab.clone(),
                            );
                        }
                        if let Some(c2) = constant_of(ab) {
                            return LlExpr::Binop(
                                Binop::Mul,
                                Box::new(LlExpr::Constant(c1 * c2)),
                                aa.clone(),
                            );
                        }
                    }
                    LlExpr::Binop(Binop::Mul, Box::new(a), Box::new(b))
                }
                Binop::ToPowOf => {
                    if settings.optimize_integer_pow {
                        if let Some(e) = cb {
                            if let Some(unrolled) = unroll_pow(&a, e) {
                                return simplify_expr(settings, &unrolled);
                            }
                        }
                    }
                    LlExpr::Binop(Binop::ToPowOf, Box::new(a), Box::new(b))
                }
                _ => LlExpr::Binop(*op, Box::new(a), Box::new(b)),
            }
        }
    }
}

fn simplify_code(settings: &OptimizeSettings, code: &LlCode) -> LlCode {
    match code {
        LlCode::Noop | LlCode::Comment(_) | LlCode::ZeroOut(_) => code.clone(),
        LlCode::Lines(items) => {
            LlCode::lines(items.iter().map(|c| simplify_code(settings, c)).collect())
        }
        LlCode::For { index, from, to, body, trace_it } => {
            let body = simplify_code(settings, body);
            if body == LlCode::Noop || from >= to {
                LlCode::Noop
            } else {
                LlCode::For {
                    index: *index,
                    from: *from,
                    to: *to,
                    body: Box::new(body),
                    trace_it: *trace_it,
                }
            }
        }
        LlCode::Set { tensor, idcs, value } => LlCode::Set {
            tensor: *tensor,
            idcs: idcs.clone(),
            value: simplify_expr(settings, value),
        },
        LlCode::SetLocal(id, value) => LlCode::SetLocal(*id, simplify_expr(settings, value)),
        LlCode::DynamicIndices { tensor, tensor_idcs, dynamic_idcs, target_dims, body, slice } => {
            LlCode::DynamicIndices {
                tensor: *tensor,
                tensor_idcs: tensor_idcs.clone(),
                dynamic_idcs: dynamic_idcs.clone(),
                target_dims: target_dims.clone(),
                body: Box::new(simplify_code(settings, body)),
                slice: *slice,
            }
        }
        LlCode::Rebalance { label, children } => LlCode::Rebalance {
            label: label.clone(),
            children: children.iter().map(|c| simplify_code(settings, c)).collect(),
        },
    }
}

/// Applies the rewrite set until a pass changes nothing.
pub fn simplify(settings: &OptimizeSettings, code: &LlCode) -> LlCode {
    let mut current = code.clone();
    for _ in 0..64 {
        let next = simplify_code(settings, &current);
        if next == current {
            return current;
        }
        current = next;
    }
    current
}
