//! Projection derivation and inference completion.
//!
//! After all row and dim variables of an update's shapes are resolved,
//! `derive_projections` re-runs the update's unification to recover the
//! step-local projection unions, then plans one loop iterator per projection
//! class over the product space.

use std::collections::HashMap;

use crate::indexing::{AxisIndex, ProjId, Projections, Symbol};

use super::unify::{self, UnifyState};
use super::{
    AxisKind, Dim, Logic, Row, RowTerminator, ShapeEnv, ShapeError, ShapeId, TraceFrame,
    UpdateStep,
};

/// Storage order of a shape's axes: batch, then output, then input.
pub(crate) const STORAGE_ORDER: [AxisKind; 3] = [AxisKind::Batch, AxisKind::Output, AxisKind::Input];

fn resolved_row(env: &ShapeEnv, id: ShapeId, kind: AxisKind) -> Result<Row, ShapeError> {
    let shape = env
        .shapes
        .get(&id)
        .ok_or_else(|| ShapeError::new(format!("unregistered shape {}", id.0)))?;
    unify::resolve_row(env, &UnifyState::default(), shape.row(kind))
}

/// Concrete dims of a shape in storage order; errors precisely when any
/// variable remains.
pub(crate) fn to_dims_in(env: &ShapeEnv, id: ShapeId) -> Result<Vec<usize>, ShapeError> {
    let mut dims = Vec::new();
    for kind in STORAGE_ORDER {
        let row = resolved_row(env, id, kind)?;
        let shape = env.shapes.get(&id).unwrap();
        if let RowTerminator::RowVar(v) = row.term {
            return Err(ShapeError::new(format!(
                "shape {} has an unresolved {kind} row (r{})",
                shape.debug_name, v.0
            ))
            .with_frame(TraceFrame::Shape(shape.to_string())));
        }
        for d in &row.dims {
            match d {
                Dim::Sized(s) => dims.push(s.size),
                Dim::Var(v) => {
                    return Err(ShapeError::new(format!(
                        "shape {} has an unresolved {kind} dim (d{})",
                        shape.debug_name, v.id.0
                    ))
                    .with_frame(TraceFrame::Shape(shape.to_string())));
                }
            }
        }
    }
    Ok(dims)
}

/// Sized axes of a shape in storage order, with projection classes.
fn sized_axes(env: &ShapeEnv, id: ShapeId) -> Result<Vec<(usize, ProjId, Option<String>)>, ShapeError> {
    let mut axes = Vec::new();
    for kind in STORAGE_ORDER {
        let row = resolved_row(env, id, kind)?;
        let shape = env.shapes.get(&id).unwrap();
        for d in &row.dims {
            match d {
                Dim::Sized(s) => axes.push((s.size, s.proj, s.label.clone())),
                Dim::Var(_) => {
                    return Err(ShapeError::new(format!(
                        "projection derivation before shape {} was fully inferred",
                        shape.debug_name
                    ))
                    .with_frame(TraceFrame::Shape(shape.to_string())));
                }
            }
        }
    }
    Ok(axes)
}

/// Iterator symbol for a projection class, honoring dedicated axis labels.
fn iterator_for(label: Option<&str>) -> Symbol {
    match label {
        Some("task_id") => Symbol::task_id(),
        Some("sample_n") | Some("sample_num") => Symbol::sample_num(),
        _ => Symbol::fresh(),
    }
}

/// Derives the loop plan of an update step.
pub(crate) fn derive_projections_in(
    env: &mut ShapeEnv,
    step: &UpdateStep,
) -> Result<Projections, ShapeError> {
    let state = unify::run_step(env, step)?;
    let lhs_id = step.shape;
    let rhs_ids: Vec<ShapeId> = match &step.logic {
        Logic::Terminal { .. } => vec![],
        Logic::Transpose(_, x) => vec![*x],
        Logic::Broadcast(_, a, b) => vec![*a, *b],
    };

    let lhs_axes = sized_axes(env, lhs_id)?;
    let mut rhs_axes = Vec::with_capacity(rhs_ids.len());
    for id in &rhs_ids {
        rhs_axes.push(sized_axes(env, *id)?);
    }

    // One product dim (and iterator) per projection class of size > 1,
    // lhs axes first, then rhs-only contraction axes in operand order.
    let mut product_space = Vec::new();
    let mut product_iterators = Vec::new();
    let mut class_iters: HashMap<ProjId, Symbol> = HashMap::new();
    let all_axes = std::iter::once(&lhs_axes).chain(rhs_axes.iter());
    for axes in all_axes {
        for (size, proj, label) in axes {
            if *size <= 1 {
                continue;
            }
            let rep = state.proj.find(*proj);
            if let std::collections::hash_map::Entry::Vacant(e) = class_iters.entry(rep) {
                let sym = iterator_for(label.as_deref());
                e.insert(sym);
                product_space.push(*size);
                product_iterators.push(sym);
            }
        }
    }

    let project = |axes: &[(usize, ProjId, Option<String>)]| -> Vec<AxisIndex> {
        axes.iter()
            .map(|(size, proj, _)| {
                if *size <= 1 {
                    AxisIndex::Fixed(0)
                } else {
                    AxisIndex::Iterator(class_iters[&state.proj.find(*proj)])
                }
            })
            .collect()
    };

    let lhs_name = env.shapes.get(&lhs_id).unwrap().debug_name.clone();
    let debug_info = match &step.logic {
        Logic::Terminal { .. } => format!("terminal {lhs_name}"),
        Logic::Transpose(k, _) => format!("{k:?} -> {lhs_name}"),
        Logic::Broadcast(k, _, _) => format!("{k:?} -> {lhs_name}"),
    };

    Ok(Projections {
        product_space,
        product_iterators,
        lhs_dims: lhs_axes.iter().map(|(s, _, _)| *s).collect(),
        rhs_dims: rhs_axes
            .iter()
            .map(|axes| axes.iter().map(|(s, _, _)| *s).collect())
            .collect(),
        project_lhs: project(&lhs_axes),
        project_rhs: rhs_axes.iter().map(|axes| project(axes)).collect(),
        debug_info,
    })
}

/// Re-propagates retained updates to a fixpoint, then closes remaining
/// broadcast variables: row variables to `Broadcastable` with no extra dims,
/// dim variables to size 1.
pub(crate) fn finish_inference_in(env: &mut ShapeEnv) -> Result<(), ShapeError> {
    let updates = env.updates.clone();
    let max_passes = updates.len().max(1) + 2;
    for _ in 0..max_passes {
        let before = (env.dim_subst.len(), env.row_subst.len());
        for step in &updates {
            unify::propagate(env, step)?;
        }
        if (env.dim_subst.len(), env.row_subst.len()) == before {
            break;
        }
    }

    let empty = UnifyState::default();
    let ids: Vec<ShapeId> = env.shapes.keys().copied().collect();
    let mut close_rows = Vec::new();
    let mut close_dims = Vec::new();
    for id in ids {
        let shape = env.shapes.get(&id).unwrap().clone();
        for kind in STORAGE_ORDER {
            let row = unify::resolve_row(env, &empty, shape.row(kind))?;
            if let RowTerminator::RowVar(v) = row.term {
                if env.broadcast_row_vars.contains(&v) {
                    close_rows.push(v);
                }
            }
            for d in &row.dims {
                if let Dim::Var(v) = d {
                    if env.broadcast_dim_vars.contains(&v.id) {
                        close_dims.push(v.id);
                    }
                }
            }
        }
    }
    for v in close_rows {
        env.row_subst.insert(
            v,
            Row {
                dims: vec![],
                constr: super::RowConstraint::Unconstrained,
                term: RowTerminator::Broadcastable,
            },
        );
    }
    for v in close_dims {
        env.dim_subst.insert(v, super::dim(1));
    }

    // Re-apply so the closures land in the stored shapes.
    let ids: Vec<ShapeId> = env.shapes.keys().copied().collect();
    for id in ids {
        let shape = env.shapes.get(&id).unwrap().clone();
        let mut resolved = shape.clone();
        for kind in [AxisKind::Batch, AxisKind::Input, AxisKind::Output] {
            *resolved.row_mut(kind) = unify::resolve_row(env, &empty, shape.row(kind))?;
        }
        env.shapes.insert(id, resolved);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::shape::{
        self, derive_projections, make_shape, propagate_shapes, to_dims, ComposeKind, Logic,
        RowSpec, UpdateStep,
    };

    #[test]
    fn pointwise_fills_variables_from_operands() {
        let a = make_shape("a", RowSpec::Fixed(vec![2]), RowSpec::Fixed(vec![]), RowSpec::Fixed(vec![3, 4]));
        let b = make_shape("b", RowSpec::Var, RowSpec::Var, RowSpec::Var);
        let c = make_shape("c", RowSpec::Var, RowSpec::Var, RowSpec::Var);
        propagate_shapes(UpdateStep {
            shape: b,
            logic: Logic::Transpose(shape::TransposeKind::Pointwise, a),
        })
        .unwrap();
        propagate_shapes(UpdateStep {
            shape: c,
            logic: Logic::Broadcast(ComposeKind::Pointwise, a, b),
        })
        .unwrap();
        assert_eq!(to_dims(c).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn compose_contracts_inner_rows() {
        // lhs: input 4 -> output 2; rhs: input 5 -> output 4; composed: 5 -> 2.
        let f = make_shape("f", RowSpec::Fixed(vec![]), RowSpec::Fixed(vec![4]), RowSpec::Fixed(vec![2]));
        let g = make_shape("g", RowSpec::Fixed(vec![]), RowSpec::Fixed(vec![5]), RowSpec::Fixed(vec![4]));
        let h = make_shape("h", RowSpec::Var, RowSpec::Var, RowSpec::Var);
        propagate_shapes(UpdateStep { shape: h, logic: Logic::Broadcast(ComposeKind::Compose, f, g) })
            .unwrap();
        assert_eq!(to_dims(h).unwrap(), vec![2, 5]);
    }

    #[test]
    fn compose_mismatch_reports_all_three_shapes() {
        let f = make_shape("fbad", RowSpec::Fixed(vec![]), RowSpec::Fixed(vec![4]), RowSpec::Fixed(vec![2]));
        let g = make_shape("gbad", RowSpec::Fixed(vec![]), RowSpec::Fixed(vec![5]), RowSpec::Fixed(vec![3]));
        let h = make_shape("hbad", RowSpec::Var, RowSpec::Var, RowSpec::Var);
        let err = propagate_shapes(UpdateStep {
            shape: h,
            logic: Logic::Broadcast(ComposeKind::Compose, f, g),
        })
        .unwrap_err();
        assert!(err.message.contains("Compose /"), "{}", err.message);
        let trace = err
            .trace
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        for name in ["fbad", "gbad", "hbad"] {
            assert!(trace.contains(name), "trace missing {name}:\n{trace}");
        }
    }

    #[test]
    fn einsum_broadcast_composition() {
        // a: 3 | 4 -> 2, b: 3 | 5 -> 4, contraction over the shared axis i.
        let a = make_shape("ea", RowSpec::Fixed(vec![3]), RowSpec::Fixed(vec![4]), RowSpec::Fixed(vec![2]));
        let b = make_shape("eb", RowSpec::Fixed(vec![3]), RowSpec::Fixed(vec![5]), RowSpec::Fixed(vec![4]));
        let c = make_shape("ec", RowSpec::Var, RowSpec::Var, RowSpec::Var);
        let step = UpdateStep {
            shape: c,
            logic: Logic::Broadcast(ComposeKind::Einsum("...|i->o; ...|...->i => ...|o".into()), a, b),
        };
        propagate_shapes(step.clone()).unwrap();
        shape::finish_inference().unwrap();
        // Storage order batch, output, input: 3 | 5 -> 2.
        assert_eq!(to_dims(c).unwrap(), vec![3, 2, 5]);

        let projections = derive_projections(&step).unwrap();
        assert_eq!(projections.product_iterators.len(), projections.product_space.len());
        assert!(projections.product_space.iter().all(|&d| d > 1));
        // Iterated: batch 3, output 2, input 5, contraction 4.
        let mut space = projections.product_space.clone();
        space.sort_unstable();
        assert_eq!(space, vec![2, 3, 4, 5]);
        // Every iterator projects into at least one operand.
        for sym in &projections.product_iterators {
            let mut seen = projections
                .project_lhs
                .iter()
                .chain(projections.project_rhs.iter().flatten());
            assert!(
                seen.any(|idx| matches!(idx, crate::indexing::AxisIndex::Iterator(s) if s == sym)),
                "iterator {sym} projects nowhere"
            );
        }
    }

    #[test]
    fn total_elems_solves_the_batch_row() {
        // 30 data elements over output dims [3, 5] force batch = [2].
        let t = make_shape("tdata", RowSpec::Var, RowSpec::Fixed(vec![]), RowSpec::Fixed(vec![3, 5]));
        propagate_shapes(UpdateStep { shape: t, logic: Logic::Terminal { total_elems: Some(30) } })
            .unwrap();
        // The constraint alone cannot name the number of batch axes; a
        // pointwise relation against a rank-1 batch row resolves it.
        let probe = make_shape("tprobe", RowSpec::Bcast(vec![2]), RowSpec::Fixed(vec![]), RowSpec::Fixed(vec![3, 5]));
        propagate_shapes(UpdateStep {
            shape: probe,
            logic: Logic::Transpose(shape::TransposeKind::Pointwise, t),
        })
        .unwrap();
        shape::finish_inference().unwrap();
        assert_eq!(to_dims(t).unwrap(), vec![2, 3, 5]);
    }

    #[test]
    fn total_elems_rejects_non_divisible() {
        let t = make_shape("tbaddata", RowSpec::Fixed(vec![]), RowSpec::Fixed(vec![]), RowSpec::Fixed(vec![4]));
        let err = propagate_shapes(UpdateStep {
            shape: t,
            logic: Logic::Terminal { total_elems: Some(30) },
        })
        .unwrap_err();
        assert!(err.message.contains("not divisible"), "{}", err.message);
    }
}
