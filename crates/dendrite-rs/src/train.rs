//! The assignment composer: gradient-update blocks and SGD steps.

use anyhow::{anyhow, ensure, Result};

use crate::hlir::{sequential, FetchOp, HlCode};
use crate::llir::Binop;
use crate::ops;
use crate::shape::{self, ComposeKind, Logic, RowSpec, UpdateStep};
use crate::tensor::{MemoryMode, Tensor};

/// A composed gradient-update block plus the tensors it trains.
#[derive(Debug, Clone)]
pub struct UpdateRoutine {
    pub loss: Tensor,
    pub params: Vec<Tensor>,
    pub code: HlCode,
}

/// Composes `[loss fwd; zero grads; grad(loss) := 1; backprop]` and assigns
/// memory modes: the loss value is hosted (changed on devices), parameters
/// and their gradients are materialized on devices.
pub fn grad_update(loss: Tensor) -> Result<UpdateRoutine> {
    let diff = loss
        .diff()
        .ok_or_else(|| anyhow!("cannot build a gradient update for non-differentiable {}", loss.header()))?;
    loss.require_mode(MemoryMode::Hosted);
    loss.set_changed_on_devices(true);

    let params = ops::parameters(loss);
    ensure!(!params.is_empty(), "loss {} has no trainable parameters", loss.header());
    // Parameters stay off the host unless device-only residence is disabled.
    let param_mode = if crate::config::get_global_flag("enable_device_only", true) {
        MemoryMode::Materialized
    } else {
        MemoryMode::Hosted
    };
    for &p in &params {
        p.require_mode(param_mode);
        if let Some(g) = p.grad() {
            g.require_mode(MemoryMode::Materialized);
        }
    }

    let fwd = HlCode::block(&format!("{} fwd", loss.label()), ops::forward_code(loss));
    let zero_grads = HlCode::block(
        "zero grads",
        sequential(
            ops::reachable_grads(loss)
                .into_iter()
                .map(|g| HlCode::Fetch { target: g, fetch: FetchOp::Constant(0.0) })
                .collect(),
        ),
    );
    let init_grad =
        HlCode::block("init grad", HlCode::Fetch { target: diff.grad, fetch: FetchOp::Constant(1.0) });
    let bprop = HlCode::block(&format!("{} bprop", loss.label()), ops::backprop_code(loss));

    shape::finish_inference().map_err(|e| anyhow!("{e}"))?;
    Ok(UpdateRoutine {
        loss,
        params,
        code: sequential(vec![fwd, zero_grads, init_grad, bprop]),
    })
}

/// SGD hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        SgdConfig { lr: 0.01, momentum: 0.0, weight_decay: 0.0, nesterov: false }
    }
}

/// One accumulating assignment `lhs := accum(lhs, op(rhs1, rhs2))` over the
/// pointwise relation of the operands.
fn assign_binop(
    accum: Binop,
    op: Binop,
    lhs: Tensor,
    rhs1: Tensor,
    rhs2: Tensor,
) -> Result<HlCode> {
    let step = UpdateStep {
        shape: lhs.shape_id(),
        logic: Logic::Broadcast(ComposeKind::Pointwise, rhs1.shape_id(), rhs2.shape_id()),
    };
    shape::propagate_shapes(step.clone()).map_err(|e| anyhow!("{e}"))?;
    Ok(HlCode::AccumBinop { zero_out: false, accum, op, lhs, rhs1, rhs2, step })
}

/// The textbook SGD step of one parameter, with optional momentum, weight
/// decay and Nesterov lookahead.
///
/// Creates the per-parameter delta `pg` (a working copy of the gradient) and,
/// with momentum, the velocity `b`; both live on devices only.
pub fn sgd_one(p: Tensor, config: &SgdConfig) -> Result<HlCode> {
    let grad = p
        .grad()
        .ok_or_else(|| anyhow!("sgd step requested for non-parameter {}", p.header()))?;
    ensure!(!p.is_literal(), "sgd step requested for literal {}", p.header());

    let label = p.label();
    let mut code = Vec::new();

    // pg := grad, a scratch copy this step owns.
    let pg = ops::Term::new(&format!("{label}.pg"))
        .precision(p.precision())
        .batch(RowSpec::Var)
        .input(RowSpec::Var)
        .output(RowSpec::Var)
        .build()?;
    pg.require_mode(MemoryMode::DeviceOnly);
    let one = ops::scalar(&format!("{label}.one"), 1.0)?;
    code.push(one.forward());
    code.push(assign_binop(Binop::Arg2, Binop::Mul, pg, one, grad)?);

    if config.weight_decay != 0.0 {
        // pg := pg + weight_decay · p
        let wd = ops::scalar(&format!("{label}.wd"), config.weight_decay)?;
        code.push(wd.forward());
        code.push(assign_binop(Binop::Add, Binop::Mul, pg, wd, p)?);
    }

    if config.momentum != 0.0 {
        // b := momentum · b + pg
        let b = ops::Term::new(&format!("{label}.b"))
            .precision(p.precision())
            .batch(RowSpec::Var)
            .input(RowSpec::Var)
            .output(RowSpec::Var)
            .build()?;
        b.require_mode(MemoryMode::Materialized);
        let mom = ops::scalar(&format!("{label}.mom"), config.momentum)?;
        code.push(mom.forward());
        code.push(assign_binop(Binop::Arg2, Binop::Mul, b, mom, b)?);
        code.push(assign_binop(Binop::Add, Binop::Mul, b, one, pg)?);
        if config.nesterov {
            // pg := pg + momentum · b
            code.push(assign_binop(Binop::Add, Binop::Mul, pg, mom, b)?);
        } else {
            // pg := b
            code.push(assign_binop(Binop::Arg2, Binop::Mul, pg, one, b)?);
        }
    }

    // p := p - lr · pg
    let neg_lr = ops::scalar(&format!("{label}.neg_lr"), -config.lr)?;
    code.push(neg_lr.forward());
    code.push(assign_binop(Binop::Add, Binop::Mul, p, neg_lr, pg)?);

    Ok(HlCode::block(&format!("sgd {label}"), sequential(code)))
}

/// Sequences `sgd_one` over every parameter of an update routine.
pub fn sgd_update(update: &UpdateRoutine, config: &SgdConfig) -> Result<HlCode> {
    let mut parts = Vec::new();
    for &p in &update.params {
        parts.push(sgd_one(p, config)?);
    }
    shape::finish_inference().map_err(|e| anyhow!("{e}"))?;
    Ok(HlCode::block("sgd update", sequential(parts)))
}
