//! Row-polymorphic unification over the three axis kinds.
//!
//! Each propagation step runs with its own substitution layer and its own
//! projection union-find; on success only the dim and row substitutions are
//! merged back into the environment, so equal-size coincidences in one step
//! never fuse iterators of unrelated operations.

use std::collections::{HashMap, HashSet};

use crate::indexing::ProjectionUnion;

use super::labels::{self, AxisLabel, KindSection, ParsedSlot};
use super::{
    AxisKind, ComposeKind, Dim, DimVar, DimVarId, Logic, Row, RowConstraint, RowTerminator,
    RowVarId, Shape, ShapeEnv, ShapeError, ShapeId, TraceFrame, TransposeKind, UpdateStep,
};

/// The step-local unification state layered over the environment.
#[derive(Debug, Default)]
pub(crate) struct UnifyState {
    pub dim_subst: HashMap<DimVarId, Dim>,
    pub row_subst: HashMap<RowVarId, Row>,
    pub broadcast_dim_vars: HashSet<DimVarId>,
    pub broadcast_row_vars: HashSet<RowVarId>,
    /// Constraints attached by terminal logics, written back on merge.
    pub pending_constraints: Vec<(ShapeId, RowConstraint)>,
    /// Projection unions proven by this step; discarded on merge, used by
    /// projection derivation.
    pub proj: ProjectionUnion,
}

#[derive(Debug, Clone)]
enum Equation {
    Rows { r: Row, subr: Row, ctx: &'static str },
    Dims { d1: Dim, d2: Dim, ctx: &'static str },
}

impl UnifyState {
    fn is_broadcast_row(&self, env: &ShapeEnv, v: RowVarId) -> bool {
        self.broadcast_row_vars.contains(&v) || env.broadcast_row_vars.contains(&v)
    }

    fn is_broadcast_dim(&self, env: &ShapeEnv, v: DimVarId) -> bool {
        self.broadcast_dim_vars.contains(&v) || env.broadcast_dim_vars.contains(&v)
    }
}

pub(crate) fn resolve_dim(env: &ShapeEnv, state: &UnifyState, dim: &Dim) -> Dim {
    let mut cur = dim.clone();
    loop {
        match &cur {
            Dim::Var(v) => {
                let next = state.dim_subst.get(&v.id).or_else(|| env.dim_subst.get(&v.id));
                match next {
                    Some(d) => cur = d.clone(),
                    None => return cur,
                }
            }
            Dim::Sized(_) => return cur,
        }
    }
}

fn merge_constraints(
    a: RowConstraint,
    b: RowConstraint,
    ctx: &str,
) -> Result<RowConstraint, ShapeError> {
    match (a, b) {
        (RowConstraint::Unconstrained, c) | (c, RowConstraint::Unconstrained) => Ok(c),
        (RowConstraint::TotalElems(m), RowConstraint::TotalElems(n)) => {
            if m == n {
                Ok(RowConstraint::TotalElems(m))
            } else {
                Err(ShapeError::new(format!(
                    "conflicting element totals {m} and {n}"
                ))
                .in_context(ctx))
            }
        }
    }
}

/// Fully resolves a row: collapses row-variable chains into the dims list and
/// resolves every dim. The constraints met along the chain are merged.
pub(crate) fn resolve_row(env: &ShapeEnv, state: &UnifyState, row: &Row) -> Result<Row, ShapeError> {
    let mut dims_tail = row.dims.clone();
    let mut constr = row.constr;
    let mut term = row.term;
    let mut guard = 0usize;
    while let RowTerminator::RowVar(v) = term {
        let next = state.row_subst.get(&v).or_else(|| env.row_subst.get(&v));
        let Some(bound) = next else { break };
        let mut dims = bound.dims.clone();
        dims.extend(dims_tail);
        dims_tail = dims;
        constr = merge_constraints(constr, bound.constr, "row resolution")?;
        term = bound.term;
        guard += 1;
        if guard > 1_000 {
            return Err(ShapeError::new("row substitution chain does not terminate"));
        }
    }
    let dims = dims_tail.iter().map(|d| resolve_dim(env, state, d)).collect();
    Ok(Row { dims, constr, term })
}

fn bind_row(
    state: &mut UnifyState,
    v: RowVarId,
    mut row: Row,
    ctx: &str,
) -> Result<(), ShapeError> {
    if let RowTerminator::RowVar(w) = row.term {
        if w == v {
            if row.dims.is_empty() {
                return Ok(());
            }
            return Err(ShapeError::new(format!(
                "row variable r{} occurs in its own solution",
                v.0
            ))
            .in_context(ctx));
        }
    }
    // A broadcastable source must not close the variable: re-open it with a
    // fresh protected row variable so later operands can still extend it.
    // Broadcast variables are closed only at the end of inference.
    if row.term == RowTerminator::Broadcastable {
        let fresh = RowVarId::fresh();
        state.broadcast_row_vars.insert(fresh);
        row.term = RowTerminator::RowVar(fresh);
    }
    state.row_subst.insert(v, row);
    Ok(())
}

fn dim_label_of(d: &Dim) -> Option<&str> {
    d.label()
}

fn unify_dim(
    env: &ShapeEnv,
    state: &mut UnifyState,
    d1: &Dim,
    d2: &Dim,
    ctx: &'static str,
) -> Result<(), ShapeError> {
    let a = resolve_dim(env, state, d1);
    let b = resolve_dim(env, state, d2);
    if let (Some(la), Some(lb)) = (dim_label_of(&a), dim_label_of(&b)) {
        if la != lb {
            return Err(ShapeError::new(format!("label mismatch: {la} vs {lb}"))
                .in_context(ctx)
                .with_frame(TraceFrame::Dim(a.to_string(), b.to_string())));
        }
    }
    match (&a, &b) {
        (Dim::Var(va), Dim::Var(vb)) => {
            if va.id == vb.id {
                return Ok(());
            }
            // Prefer to eliminate variables outside the broadcast set.
            let (victim, keep) = if !state.is_broadcast_dim(env, va.id) {
                (va.clone(), b.clone())
            } else if !state.is_broadcast_dim(env, vb.id) {
                (vb.clone(), a.clone())
            } else {
                (va.clone(), b.clone())
            };
            state.dim_subst.insert(victim.id, keep);
            Ok(())
        }
        (Dim::Var(v), Dim::Sized(s)) => {
            // A size-1 dim broadcasts: leave the variable open for a larger
            // operand, defaulting it to 1 only at the end of inference.
            if s.size == 1 {
                state.broadcast_dim_vars.insert(v.id);
            } else {
                state.dim_subst.insert(v.id, b.clone());
            }
            Ok(())
        }
        (Dim::Sized(s), Dim::Var(v)) => {
            if s.size == 1 {
                state.broadcast_dim_vars.insert(v.id);
            } else {
                state.dim_subst.insert(v.id, a.clone());
            }
            Ok(())
        }
        (Dim::Sized(da), Dim::Sized(db)) => {
            if da.size == db.size {
                state.proj.union(da.proj, db.proj);
                Ok(())
            } else if da.size == 1 || db.size == 1 {
                // Size-1 dims broadcast against anything.
                Ok(())
            } else {
                Err(ShapeError::new(format!("dim mismatch: {} vs {}", da.size, db.size))
                    .in_context(ctx)
                    .with_frame(TraceFrame::Dim(a.to_string(), b.to_string())))
            }
        }
    }
}

/// Solves or checks a `TotalElems` constraint once enough dims are concrete.
fn apply_constraint(
    env: &ShapeEnv,
    state: &mut UnifyState,
    row: &Row,
    ctx: &'static str,
) -> Result<(), ShapeError> {
    let row = resolve_row(env, state, row)?;
    let RowConstraint::TotalElems(total) = row.constr else { return Ok(()) };
    if matches!(row.term, RowTerminator::RowVar(_)) {
        return Ok(());
    }
    let mut product = 1usize;
    let mut unsolved: Option<&Dim> = None;
    for d in &row.dims {
        match d {
            Dim::Sized(s) => product *= s.size,
            Dim::Var(_) => {
                if unsolved.is_some() {
                    return Ok(());
                }
                unsolved = Some(d);
            }
        }
    }
    match unsolved {
        None => {
            if product != total {
                return Err(ShapeError::new(format!(
                    "row of {product} elements where {total} required"
                ))
                .in_context(ctx)
                .with_frame(TraceFrame::Row(row.to_string(), format!("total {total}"))));
            }
            Ok(())
        }
        Some(var) => {
            if product == 0 {
                return Ok(());
            }
            if total % product != 0 {
                return Err(ShapeError::new(format!(
                    "element total {total} is not divisible by the known dims product {product}"
                ))
                .in_context(ctx)
                .with_frame(TraceFrame::Row(row.to_string(), format!("total {total}"))));
            }
            let solved = super::dim(total / product);
            unify_dim(env, state, var, &solved, ctx)
        }
    }
}

fn unify_rows(
    env: &ShapeEnv,
    state: &mut UnifyState,
    r: &Row,
    subr: &Row,
    ctx: &'static str,
    work: &mut Vec<Equation>,
) -> Result<(), ShapeError> {
    let a = resolve_row(env, state, r)?;
    let b = resolve_row(env, state, subr)?;

    // Bare row variables substitute wholesale, preferring to eliminate
    // variables outside the broadcast-protected set.
    match (a.is_bare_var(), b.is_bare_var()) {
        (Some(va), Some(vb)) => {
            if va == vb {
                return Ok(());
            }
            let constr = merge_constraints(a.constr, b.constr, ctx)?;
            if !state.is_broadcast_row(env, va) {
                bind_row(state, va, Row { constr, ..b }, ctx)?;
            } else if !state.is_broadcast_row(env, vb) {
                bind_row(state, vb, Row { constr, ..a }, ctx)?;
            } else {
                bind_row(state, va, Row { constr, ..b }, ctx)?;
            }
            return Ok(());
        }
        (Some(va), None) => {
            let constr = merge_constraints(a.constr, b.constr, ctx)?;
            let merged = Row { constr, ..b };
            bind_row(state, va, merged.clone(), ctx)?;
            apply_constraint(env, state, &merged, ctx)?;
            return Ok(());
        }
        (None, Some(vb)) => {
            let constr = merge_constraints(a.constr, b.constr, ctx)?;
            let merged = Row { constr, ..a };
            bind_row(state, vb, merged.clone(), ctx)?;
            apply_constraint(env, state, &merged, ctx)?;
            return Ok(());
        }
        (None, None) => {}
    }

    let na = a.dims.len();
    let nb = b.dims.len();
    let common = na.min(nb);
    // Align from the right: the common suffix unifies dim by dim.
    for k in 0..common {
        work.push(Equation::Dims {
            d1: a.dims[na - common + k].clone(),
            d2: b.dims[nb - common + k].clone(),
            ctx,
        });
    }
    if na > nb {
        let extra = a.dims[..na - nb].to_vec();
        match b.term {
            RowTerminator::RowVar(v) => {
                let prefix = Row { dims: extra, constr: RowConstraint::Unconstrained, term: a.term };
                bind_row(state, v, prefix, ctx)?;
            }
            RowTerminator::Broadcastable => {}
            RowTerminator::Fixed => {
                return Err(ShapeError::new(format!(
                    "row has {nb} axes where {na} are required"
                ))
                .in_context(ctx)
                .with_frame(TraceFrame::Row(a.to_string(), b.to_string())));
            }
        }
    } else if nb > na {
        let extra = b.dims[..nb - na].to_vec();
        match a.term {
            RowTerminator::RowVar(v) => {
                let prefix = Row { dims: extra, constr: RowConstraint::Unconstrained, term: b.term };
                bind_row(state, v, prefix, ctx)?;
            }
            RowTerminator::Broadcastable => {}
            RowTerminator::Fixed => {
                return Err(ShapeError::new(format!(
                    "row has {na} axes where {nb} are required"
                ))
                .in_context(ctx)
                .with_frame(TraceFrame::Row(a.to_string(), b.to_string())));
            }
        }
    } else {
        // Equal axis counts: unify the terminators.
        match (a.term, b.term) {
            (RowTerminator::RowVar(va), RowTerminator::RowVar(vb)) if va != vb => {
                let empty = |term| Row { dims: vec![], constr: RowConstraint::Unconstrained, term };
                if !state.is_broadcast_row(env, va) {
                    bind_row(state, va, empty(RowTerminator::RowVar(vb)), ctx)?;
                } else if !state.is_broadcast_row(env, vb) {
                    bind_row(state, vb, empty(RowTerminator::RowVar(va)), ctx)?;
                } else {
                    bind_row(state, va, empty(RowTerminator::RowVar(vb)), ctx)?;
                }
            }
            (RowTerminator::RowVar(v), other) => {
                bind_row(
                    state,
                    v,
                    Row { dims: vec![], constr: RowConstraint::Unconstrained, term: other },
                    ctx,
                )?;
            }
            (other, RowTerminator::RowVar(v)) => {
                bind_row(
                    state,
                    v,
                    Row { dims: vec![], constr: RowConstraint::Unconstrained, term: other },
                    ctx,
                )?;
            }
            _ => {}
        }
    }
    apply_constraint(env, state, &a, ctx)?;
    apply_constraint(env, state, &b, ctx)?;
    Ok(())
}

fn unify(env: &ShapeEnv, state: &mut UnifyState, mut work: Vec<Equation>) -> Result<(), ShapeError> {
    while let Some(eq) = work.pop() {
        match eq {
            Equation::Rows { r, subr, ctx } => unify_rows(env, state, &r, &subr, ctx, &mut work)?,
            Equation::Dims { d1, d2, ctx } => unify_dim(env, state, &d1, &d2, ctx)?,
        }
    }
    Ok(())
}

/// Builds a row from a parsed label section, sharing dim variables by label
/// and row variables by axis kind.
fn row_of_section(
    section: &KindSection,
    kind: AxisKind,
    label_vars: &mut HashMap<String, Dim>,
    kind_vars: &mut HashMap<AxisKind, RowVarId>,
    state: &mut UnifyState,
) -> Row {
    let dims = section
        .labels
        .iter()
        .map(|l| match l {
            AxisLabel::Placeholder => super::dim_var(),
            AxisLabel::Label(name) => label_vars
                .entry(name.clone())
                .or_insert_with(|| {
                    Dim::Var(DimVar { id: DimVarId::fresh(), label: Some(name.clone()) })
                })
                .clone(),
        })
        .collect();
    let term = if section.ellipsis {
        let v = *kind_vars.entry(kind).or_insert_with(|| {
            let v = RowVarId::fresh();
            state.broadcast_row_vars.insert(v);
            v
        });
        RowTerminator::RowVar(v)
    } else {
        RowTerminator::Fixed
    };
    Row { dims, constr: RowConstraint::Unconstrained, term }
}

fn slot_equations(
    slot: &ParsedSlot,
    shape: &Shape,
    label_vars: &mut HashMap<String, Dim>,
    kind_vars: &mut HashMap<AxisKind, RowVarId>,
    state: &mut UnifyState,
    ctx: &'static str,
    work: &mut Vec<Equation>,
) {
    for (kind, section) in [
        (AxisKind::Batch, &slot.batch),
        (AxisKind::Input, &slot.input),
        (AxisKind::Output, &slot.output),
    ] {
        let parsed = row_of_section(section, kind, label_vars, kind_vars, state);
        work.push(Equation::Rows { r: parsed, subr: shape.row(kind).clone(), ctx });
    }
}

fn shape_frames(shapes: &[&Shape]) -> Vec<TraceFrame> {
    shapes.iter().map(|s| TraceFrame::Shape(s.to_string())).collect()
}

fn get(env: &ShapeEnv, id: ShapeId) -> Result<Shape, ShapeError> {
    env.shapes
        .get(&id)
        .cloned()
        .ok_or_else(|| ShapeError::new(format!("unregistered shape {}", id.0)))
}

/// Runs one update step against the environment without merging: returns the
/// step-local state (substitutions, projection unions, pending constraints).
pub(crate) fn run_step(env: &ShapeEnv, step: &UpdateStep) -> Result<UnifyState, ShapeError> {
    let mut state = UnifyState::default();
    let mut work: Vec<Equation> = Vec::new();
    let cur = get(env, step.shape)?;
    let mut frames: Vec<TraceFrame>;
    let ctx: &'static str;
    match &step.logic {
        Logic::Terminal { total_elems } => {
            ctx = "Terminal";
            frames = shape_frames(&[&cur]);
            if let Some(total) = total_elems {
                let input = resolve_row(env, &state, &cur.input)?;
                let output = resolve_row(env, &state, &cur.output)?;
                if let (Some(i), Some(o)) = (input.sizes(), output.sizes()) {
                    if !matches!(input.term, RowTerminator::RowVar(_))
                        && !matches!(output.term, RowTerminator::RowVar(_))
                    {
                        let io: usize = i.iter().chain(o.iter()).product();
                        if io > 0 {
                            if total % io != 0 {
                                return Err(ShapeError::new(format!(
                                    "data length {total} is not divisible by the non-batch element count {io}"
                                ))
                                .in_context(ctx)
                                .with_frame(TraceFrame::Shape(cur.to_string())));
                            }
                            let batch_elems = total / io;
                            let mut batch = cur.batch.clone();
                            batch.constr = merge_constraints(
                                batch.constr,
                                RowConstraint::TotalElems(batch_elems),
                                ctx,
                            )?;
                            state
                                .pending_constraints
                                .push((cur.id, RowConstraint::TotalElems(batch_elems)));
                            apply_constraint(env, &mut state, &batch, ctx)
                                .map_err(|e| e.with_frame(TraceFrame::Shape(cur.to_string())))?;
                        }
                    }
                }
            }
        }
        Logic::Transpose(kind, operand) => {
            let x = get(env, *operand)?;
            frames = shape_frames(&[&cur, &x]);
            match kind {
                TransposeKind::Pointwise => {
                    ctx = "Pointwise unary";
                    for k in [AxisKind::Batch, AxisKind::Input, AxisKind::Output] {
                        work.push(Equation::Rows {
                            r: cur.row(k).clone(),
                            subr: x.row(k).clone(),
                            ctx,
                        });
                    }
                }
                TransposeKind::TransposeIO => {
                    ctx = "Transpose";
                    work.push(Equation::Rows {
                        r: cur.batch.clone(),
                        subr: x.batch.clone(),
                        ctx,
                    });
                    work.push(Equation::Rows {
                        r: cur.input.clone(),
                        subr: x.output.clone(),
                        ctx,
                    });
                    work.push(Equation::Rows {
                        r: cur.output.clone(),
                        subr: x.input.clone(),
                        ctx,
                    });
                }
                TransposeKind::Permute(spec) => {
                    ctx = "Permute";
                    let (slots, lhs) =
                        labels::parse_einsum(spec).map_err(|e| e.in_context(ctx))?;
                    if slots.len() != 1 {
                        return Err(ShapeError::new(format!(
                            "permute spec \"{spec}\" must name exactly one operand"
                        ))
                        .in_context(ctx));
                    }
                    let mut label_vars = HashMap::new();
                    let mut kind_vars = HashMap::new();
                    slot_equations(
                        &slots[0],
                        &x,
                        &mut label_vars,
                        &mut kind_vars,
                        &mut state,
                        ctx,
                        &mut work,
                    );
                    slot_equations(
                        &lhs,
                        &cur,
                        &mut label_vars,
                        &mut kind_vars,
                        &mut state,
                        ctx,
                        &mut work,
                    );
                }
            }
        }
        Logic::Broadcast(kind, left, right) => {
            let a = get(env, *left)?;
            let b = get(env, *right)?;
            frames = shape_frames(&[&cur, &a, &b]);
            match kind {
                ComposeKind::Pointwise => {
                    ctx = "Pointwise binary";
                    for k in [AxisKind::Batch, AxisKind::Input, AxisKind::Output] {
                        work.push(Equation::Rows {
                            r: cur.row(k).clone(),
                            subr: a.row(k).clone(),
                            ctx,
                        });
                        work.push(Equation::Rows {
                            r: cur.row(k).clone(),
                            subr: b.row(k).clone(),
                            ctx,
                        });
                    }
                }
                ComposeKind::Compose => {
                    ctx = "Compose";
                    work.push(Equation::Rows { r: cur.batch.clone(), subr: a.batch.clone(), ctx });
                    work.push(Equation::Rows { r: cur.batch.clone(), subr: b.batch.clone(), ctx });
                    work.push(Equation::Rows {
                        r: cur.output.clone(),
                        subr: a.output.clone(),
                        ctx,
                    });
                    work.push(Equation::Rows { r: cur.input.clone(), subr: b.input.clone(), ctx });
                    work.push(Equation::Rows { r: a.input.clone(), subr: b.output.clone(), ctx });
                }
                ComposeKind::Einsum(spec) => {
                    ctx = "Einsum";
                    let (slots, lhs) =
                        labels::parse_einsum(spec).map_err(|e| e.in_context(ctx))?;
                    if slots.len() != 2 {
                        return Err(ShapeError::new(format!(
                            "einsum spec \"{spec}\" must name two operands for a binary op"
                        ))
                        .in_context(ctx));
                    }
                    let mut label_vars = HashMap::new();
                    let mut kind_vars = HashMap::new();
                    for (slot, shape) in slots.iter().zip([&a, &b]) {
                        slot_equations(
                            slot,
                            shape,
                            &mut label_vars,
                            &mut kind_vars,
                            &mut state,
                            ctx,
                            &mut work,
                        );
                    }
                    slot_equations(
                        &lhs,
                        &cur,
                        &mut label_vars,
                        &mut kind_vars,
                        &mut state,
                        ctx,
                        &mut work,
                    );
                }
            }
        }
    }
    // Equations were pushed in priority order; unify pops from the back, so
    // reverse to process operand equations first.
    work.reverse();
    unify(env, &mut state, work).map_err(|e| {
        let mut err = e;
        for frame in frames.drain(..) {
            err = err.with_frame(frame);
        }
        err
    })?;
    Ok(state)
}

/// Applies the environment substitutions to every registered shape.
fn apply_to_shapes(env: &mut ShapeEnv) -> Result<(), ShapeError> {
    let ids: Vec<ShapeId> = env.shapes.keys().copied().collect();
    let empty = UnifyState::default();
    for id in ids {
        let shape = env.shapes.get(&id).unwrap().clone();
        let mut resolved = shape.clone();
        for kind in [AxisKind::Batch, AxisKind::Input, AxisKind::Output] {
            *resolved.row_mut(kind) = resolve_row(env, &empty, shape.row(kind))?;
        }
        env.shapes.insert(id, resolved);
    }
    Ok(())
}

/// Runs a step and merges its substitutions into the environment. The step's
/// projection unions are discarded.
pub(crate) fn propagate(env: &mut ShapeEnv, step: &UpdateStep) -> Result<(), ShapeError> {
    let state = run_step(env, step)?;
    env.dim_subst.extend(state.dim_subst);
    env.row_subst.extend(state.row_subst);
    env.broadcast_dim_vars.extend(state.broadcast_dim_vars);
    env.broadcast_row_vars.extend(state.broadcast_row_vars);
    for (shape, constr) in state.pending_constraints {
        if let Some(s) = env.shapes.get_mut(&shape) {
            s.batch.constr = constr;
        }
    }
    apply_to_shapes(env)
}
