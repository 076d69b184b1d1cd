//! A minimal expression builder over the assignment graph.
//!
//! Each operation creates a result tensor, registers its shape logic, and
//! attaches one forward assignment plus the backward assignments into its
//! operands' gradients. Composition into runnable blocks happens in
//! [`crate::train`].

use anyhow::{anyhow, Result};

use crate::buffer::InitOp;
use crate::hlir::{FetchOp, HlCode};
use crate::llir::{Binop, SyntheticFn, Unop};
use crate::precision::Precision;
use crate::shape::{self, ComposeKind, Logic, RowSpec, TransposeKind, UpdateStep};
use crate::tensor::{self, Diff, MemoryMode, Tensor};

/// Specification of a leaf tensor.
pub struct Term {
    pub label: String,
    pub precision: Precision,
    pub batch: RowSpec,
    pub input: RowSpec,
    pub output: RowSpec,
    /// Host-side initialization, if the leaf is backed by host data.
    pub init: Option<InitOp>,
    /// Runtime fill, if the leaf is fetched each run.
    pub fetch: Option<FetchOp>,
    pub differentiable: bool,
    /// Literals are excluded from parameter collection.
    pub literal: bool,
}

impl Term {
    pub fn new(label: &str) -> Term {
        Term {
            label: label.to_string(),
            precision: Precision::Double,
            batch: RowSpec::Fixed(vec![]),
            input: RowSpec::Fixed(vec![]),
            output: RowSpec::Fixed(vec![]),
            init: None,
            fetch: None,
            differentiable: false,
            literal: false,
        }
    }

    pub fn precision(mut self, precision: Precision) -> Term {
        self.precision = precision;
        self
    }

    pub fn batch(mut self, spec: RowSpec) -> Term {
        self.batch = spec;
        self
    }

    pub fn input(mut self, spec: RowSpec) -> Term {
        self.input = spec;
        self
    }

    pub fn output(mut self, spec: RowSpec) -> Term {
        self.output = spec;
        self
    }

    pub fn init(mut self, init: InitOp) -> Term {
        self.init = Some(init);
        self
    }

    pub fn fetch(mut self, fetch: FetchOp) -> Term {
        self.fetch = Some(fetch);
        self
    }

    pub fn differentiable(mut self) -> Term {
        self.differentiable = true;
        self
    }

    pub fn literal(mut self) -> Term {
        self.literal = true;
        self
    }

    /// Registers the leaf and propagates its terminal shape logic.
    pub fn build(self) -> Result<Tensor> {
        let shape = shape::make_shape(
            &self.label,
            self.batch.clone(),
            self.input.clone(),
            self.output.clone(),
        );
        let total_elems = match &self.init {
            Some(InitOp::ConstantFill { values, strict: true }) => Some(values.len()),
            Some(InitOp::FileMapped { path, precision }) => std::fs::metadata(path)
                .ok()
                .map(|m| m.len() as usize / precision.size_in_bytes()),
            _ => None,
        };
        let step = UpdateStep { shape, logic: Logic::Terminal { total_elems } };
        shape::propagate_shapes(step.clone()).map_err(|e| anyhow!("{e}"))?;
        let t = tensor::register(tensor::Node {
            precision: self.precision,
            label: self.label.clone(),
            shape,
            dims: None,
            mode: None,
            changed_on_devices: false,
            buffer: None,
            init: self.init,
            forward: HlCode::Noop,
            diff: None,
            literal: self.literal,
            value_distributes_over_sum: false,
            children: vec![],
        });
        let forward = match self.fetch {
            Some(fetch) => HlCode::Fetch { target: t, fetch },
            None => HlCode::Noop,
        };
        tensor::with_node_mut(t, |n| n.forward = forward);
        if self.differentiable {
            attach_grad(t)?;
        }
        Ok(t)
    }
}

/// A trainable leaf: differentiable, uniform-initialized, broadcast-open rows.
pub fn param(label: &str, dims: &[usize]) -> Result<Tensor> {
    Term::new(label)
        .batch(RowSpec::Bcast(vec![]))
        .input(RowSpec::Bcast(vec![]))
        .output(RowSpec::Bcast(dims.to_vec()))
        .init(InitOp::StandardUniform)
        .differentiable()
        .build()
}

/// A non-differentiable data leaf with a host init.
pub fn data(label: &str, batch: &[usize], output: &[usize], init: InitOp) -> Result<Tensor> {
    Term::new(label)
        .batch(RowSpec::Fixed(batch.to_vec()))
        .output(RowSpec::Fixed(output.to_vec()))
        .init(init)
        .build()
}

/// A literal scalar broadcastable against anything.
pub fn scalar(label: &str, value: f64) -> Result<Tensor> {
    Term::new(label)
        .batch(RowSpec::Bcast(vec![]))
        .input(RowSpec::Bcast(vec![]))
        .output(RowSpec::Bcast(vec![]))
        .fetch(FetchOp::Constant(value))
        .literal()
        .build()
}

/// A leaf filled by a host callback over the session step and indices.
pub fn callback_data(
    label: &str,
    batch: &[usize],
    output: &[usize],
    f: SyntheticFn,
) -> Result<Tensor> {
    Term::new(label)
        .batch(RowSpec::Fixed(batch.to_vec()))
        .output(RowSpec::Fixed(output.to_vec()))
        .fetch(FetchOp::Callback(f))
        .build()
}

fn attach_grad(t: Tensor) -> Result<()> {
    let label = format!("{}.grad", t.label());
    let shape = t.shape_id();
    let grad = tensor::register(tensor::Node {
        precision: t.precision(),
        label,
        shape,
        dims: None,
        mode: None,
        changed_on_devices: false,
        buffer: None,
        init: None,
        forward: HlCode::Noop,
        diff: None,
        literal: false,
        value_distributes_over_sum: false,
        children: vec![],
    });
    tensor::with_node_mut(t, |n| {
        n.diff = Some(Diff { grad, backprop: HlCode::Noop, zero_grads: HlCode::Noop })
    });
    Ok(())
}

fn wider(a: Precision, b: Precision) -> Precision {
    if a.size_in_bytes() >= b.size_in_bytes() {
        a
    } else {
        b
    }
}

fn is_diff(t: Tensor) -> bool {
    t.diff().is_some()
}

/// Registers a non-terminal node with open rows and the given logic, and
/// attaches the forward assignment.
fn apply_op(
    label: &str,
    logic: Logic,
    children: Vec<Tensor>,
    precision: Precision,
    forward_of: impl FnOnce(Tensor, UpdateStep) -> HlCode,
) -> Result<Tensor> {
    let shape = shape::make_shape(label, RowSpec::Var, RowSpec::Var, RowSpec::Var);
    let step = UpdateStep { shape, logic };
    shape::propagate_shapes(step.clone()).map_err(|e| anyhow!("{e}"))?;
    let t = tensor::register(tensor::Node {
        precision,
        label: label.to_string(),
        shape,
        dims: None,
        mode: None,
        changed_on_devices: false,
        buffer: None,
        init: None,
        forward: HlCode::Noop,
        diff: None,
        literal: false,
        value_distributes_over_sum: false,
        children,
    });
    let forward = forward_of(t, step);
    tensor::with_node_mut(t, |n| n.forward = forward);
    Ok(t)
}

/// A gradient accumulation `lhs.grad += op(rhs1, rhs2)` over its own logic.
fn grad_accum_binop(
    lhs_grad: Tensor,
    op: Binop,
    rhs1: Tensor,
    rhs2: Tensor,
    logic: Logic,
) -> Result<HlCode> {
    let step = UpdateStep { shape: lhs_grad.shape_id(), logic };
    shape::propagate_shapes(step.clone()).map_err(|e| anyhow!("{e}"))?;
    Ok(HlCode::AccumBinop {
        zero_out: false,
        accum: Binop::Add,
        op,
        lhs: lhs_grad,
        rhs1,
        rhs2,
        step,
    })
}

fn grad_accum_unop(lhs_grad: Tensor, op: Unop, rhs: Tensor, logic: Logic) -> Result<HlCode> {
    let step = UpdateStep { shape: lhs_grad.shape_id(), logic };
    shape::propagate_shapes(step.clone()).map_err(|e| anyhow!("{e}"))?;
    Ok(HlCode::AccumUnop { zero_out: false, accum: Binop::Add, op, lhs: lhs_grad, rhs, step })
}

fn finish_diff(t: Tensor, parts: Vec<HlCode>) -> Result<()> {
    if parts.is_empty() {
        return Ok(());
    }
    attach_grad(t)?;
    let backprop = crate::hlir::sequential(parts);
    tensor::with_node_mut(t, |n| {
        if let Some(diff) = &mut n.diff {
            diff.backprop = backprop;
        }
    });
    Ok(())
}

/// Pointwise addition with broadcasting.
pub fn add(label: &str, a: Tensor, b: Tensor) -> Result<Tensor> {
    let c = apply_op(
        label,
        Logic::Broadcast(ComposeKind::Pointwise, a.shape_id(), b.shape_id()),
        vec![a, b],
        wider(a.precision(), b.precision()),
        |t, step| HlCode::AccumBinop {
            zero_out: false,
            accum: Binop::Arg2,
            op: Binop::Add,
            lhs: t,
            rhs1: a,
            rhs2: b,
            step,
        },
    )?;
    let mut parts = Vec::new();
    for operand in [a, b] {
        if let Some(diff) = operand.diff() {
            parts.push(grad_accum_unop(
                diff.grad,
                Unop::Identity,
                grad_of(c),
                Logic::Transpose(TransposeKind::Pointwise, c.shape_id()),
            )?);
        }
    }
    finish_diff(c, parts)?;
    Ok(c)
}

/// Pointwise multiplication with broadcasting.
pub fn mul(label: &str, a: Tensor, b: Tensor) -> Result<Tensor> {
    let c = apply_op(
        label,
        Logic::Broadcast(ComposeKind::Pointwise, a.shape_id(), b.shape_id()),
        vec![a, b],
        wider(a.precision(), b.precision()),
        |t, step| HlCode::AccumBinop {
            zero_out: false,
            accum: Binop::Arg2,
            op: Binop::Mul,
            lhs: t,
            rhs1: a,
            rhs2: b,
            step,
        },
    )?;
    let mut parts = Vec::new();
    if let Some(diff) = a.diff() {
        parts.push(grad_accum_binop(
            diff.grad,
            Binop::Mul,
            grad_of(c),
            b,
            Logic::Broadcast(ComposeKind::Pointwise, c.shape_id(), b.shape_id()),
        )?);
    }
    if let Some(diff) = b.diff() {
        parts.push(grad_accum_binop(
            diff.grad,
            Binop::Mul,
            grad_of(c),
            a,
            Logic::Broadcast(ComposeKind::Pointwise, c.shape_id(), a.shape_id()),
        )?);
    }
    finish_diff(c, parts)?;
    Ok(c)
}

/// `a - b`, expressed as `a + (-1)·b`.
pub fn sub(label: &str, a: Tensor, b: Tensor) -> Result<Tensor> {
    let neg_one = scalar(&format!("{label}.neg1"), -1.0)?;
    let neg_b = mul(&format!("{label}.neg"), neg_one, b)?;
    add(label, a, neg_b)
}

/// Generalized contraction per an einsum spec (`"rhs1;rhs2=>lhs"`).
pub fn einsum(label: &str, spec: &str, a: Tensor, b: Tensor) -> Result<Tensor> {
    let c = apply_op(
        label,
        Logic::Broadcast(ComposeKind::Einsum(spec.to_string()), a.shape_id(), b.shape_id()),
        vec![a, b],
        wider(a.precision(), b.precision()),
        |t, step| HlCode::AccumBinop {
            zero_out: true,
            accum: Binop::Add,
            op: Binop::Mul,
            lhs: t,
            rhs1: a,
            rhs2: b,
            step,
        },
    )?;
    // Einsum gradients swap the result slot with the operand's slot.
    let (slots, lhs_slot) = shape::labels::parse_einsum(spec).map_err(|e| anyhow!("{e}"))?;
    let print = shape::labels::print_slot;
    let (sa, sb, sl) = (print(&slots[0]), print(&slots[1]), print(&lhs_slot));
    let mut parts = Vec::new();
    if let Some(diff) = a.diff() {
        let da_spec = format!("{sl}; {sb} => {sa}");
        parts.push(grad_accum_binop(
            diff.grad,
            Binop::Mul,
            grad_of(c),
            b,
            Logic::Broadcast(ComposeKind::Einsum(da_spec), c.shape_id(), b.shape_id()),
        )?);
    }
    if let Some(diff) = b.diff() {
        let db_spec = format!("{sl}; {sa} => {sb}");
        parts.push(grad_accum_binop(
            diff.grad,
            Binop::Mul,
            grad_of(c),
            a,
            Logic::Broadcast(ComposeKind::Einsum(db_spec), c.shape_id(), a.shape_id()),
        )?);
    }
    finish_diff(c, parts)?;
    Ok(c)
}

/// Function composition (`c[o,k] = Σ_j a[o,j]·b[j,k]`), the matmul of the
/// input/output row convention.
pub fn matmul(label: &str, a: Tensor, b: Tensor) -> Result<Tensor> {
    let c = apply_op(
        label,
        Logic::Broadcast(ComposeKind::Compose, a.shape_id(), b.shape_id()),
        vec![a, b],
        wider(a.precision(), b.precision()),
        |t, step| HlCode::AccumBinop {
            zero_out: true,
            accum: Binop::Add,
            op: Binop::Mul,
            lhs: t,
            rhs1: a,
            rhs2: b,
            step,
        },
    )?;
    let mut parts = Vec::new();
    if let Some(diff) = a.diff() {
        parts.push(grad_accum_binop(
            diff.grad,
            Binop::Mul,
            grad_of(c),
            b,
            Logic::Broadcast(
                ComposeKind::Einsum("...|k->o; ...|k->j => ...|j->o".into()),
                c.shape_id(),
                b.shape_id(),
            ),
        )?);
    }
    if let Some(diff) = b.diff() {
        parts.push(grad_accum_binop(
            diff.grad,
            Binop::Mul,
            grad_of(c),
            a,
            Logic::Broadcast(
                ComposeKind::Einsum("...|k->o; ...|j->o => ...|k->j".into()),
                c.shape_id(),
                a.shape_id(),
            ),
        )?);
    }
    finish_diff(c, parts)?;
    Ok(c)
}

/// Pointwise rectified linear unit.
pub fn relu(label: &str, a: Tensor) -> Result<Tensor> {
    let c = apply_op(
        label,
        Logic::Transpose(TransposeKind::Pointwise, a.shape_id()),
        vec![a],
        a.precision(),
        |t, step| HlCode::AccumUnop {
            zero_out: false,
            accum: Binop::Arg2,
            op: Unop::Relu,
            lhs: t,
            rhs: a,
            step,
        },
    )?;
    let mut parts = Vec::new();
    if let Some(diff) = a.diff() {
        // The gate passes the incoming gradient where the input is positive.
        parts.push(grad_accum_binop(
            diff.grad,
            Binop::ReluGate,
            a,
            grad_of(c),
            Logic::Broadcast(ComposeKind::Pointwise, a.shape_id(), c.shape_id()),
        )?);
    }
    finish_diff(c, parts)?;
    Ok(c)
}

/// Axis relabeling per a permute spec (`"rhs => lhs"`).
pub fn permute(label: &str, spec: &str, a: Tensor) -> Result<Tensor> {
    let c = apply_op(
        label,
        Logic::Transpose(TransposeKind::Permute(spec.to_string()), a.shape_id()),
        vec![a],
        a.precision(),
        |t, step| HlCode::AccumUnop {
            zero_out: false,
            accum: Binop::Arg2,
            op: Unop::Identity,
            lhs: t,
            rhs: a,
            step,
        },
    )?;
    Ok(c)
}

/// `a` raised to the constant power `exponent`.
pub fn pow(label: &str, a: Tensor, exponent: f64) -> Result<Tensor> {
    let e = scalar(&format!("{label}.exp"), exponent)?;
    let c = apply_op(
        label,
        Logic::Broadcast(ComposeKind::Pointwise, a.shape_id(), e.shape_id()),
        vec![a, e],
        a.precision(),
        |t, step| HlCode::AccumBinop {
            zero_out: false,
            accum: Binop::Arg2,
            op: Binop::ToPowOf,
            lhs: t,
            rhs1: a,
            rhs2: e,
            step,
        },
    )?;
    let mut parts = Vec::new();
    if let Some(diff) = a.diff() {
        // d(a^n) = n · a^(n-1) · dc, via auxiliary products computed in the
        // backward block.
        let em1 = scalar(&format!("{label}.expm1"), exponent - 1.0)?;
        let a_pow = apply_op(
            &format!("{label}.dpow"),
            Logic::Broadcast(ComposeKind::Pointwise, a.shape_id(), em1.shape_id()),
            vec![a, em1],
            a.precision(),
            |t, step| HlCode::AccumBinop {
                zero_out: false,
                accum: Binop::Arg2,
                op: Binop::ToPowOf,
                lhs: t,
                rhs1: a,
                rhs2: em1,
                step,
            },
        )?;
        let n_scalar = scalar(&format!("{label}.n"), exponent)?;
        let scaled = apply_op(
            &format!("{label}.dscale"),
            Logic::Broadcast(ComposeKind::Pointwise, n_scalar.shape_id(), a_pow.shape_id()),
            vec![n_scalar, a_pow],
            a.precision(),
            |t, step| HlCode::AccumBinop {
                zero_out: false,
                accum: Binop::Arg2,
                op: Binop::Mul,
                lhs: t,
                rhs1: n_scalar,
                rhs2: a_pow,
                step,
            },
        )?;
        let accum = grad_accum_binop(
            diff.grad,
            Binop::Mul,
            grad_of(c),
            scaled,
            Logic::Broadcast(ComposeKind::Pointwise, c.shape_id(), scaled.shape_id()),
        )?;
        parts.push(crate::hlir::sequential(vec![
            n_scalar.forward(),
            em1.forward(),
            a_pow.forward(),
            scaled.forward(),
            accum,
        ]));
    }
    finish_diff(c, parts)?;
    Ok(c)
}

fn grad_of(t: Tensor) -> Tensor {
    t.grad().expect("gradient requested for a non-differentiable tensor")
}

/// Collects the differentiable, non-literal leaves under `t` (the trainable
/// parameters), in creation order.
pub fn parameters(t: Tensor) -> Vec<Tensor> {
    fn go(t: Tensor, out: &mut Vec<Tensor>, seen: &mut std::collections::HashSet<Tensor>) {
        if !seen.insert(t) {
            return;
        }
        let children = t.children();
        if children.is_empty() {
            if is_diff(t) && !t.is_literal() && !out.contains(&t) {
                out.push(t);
            }
            return;
        }
        for child in children {
            go(child, out, seen);
        }
    }
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    go(t, &mut out, &mut seen);
    out.sort();
    out
}

/// The forward code of the whole subexpression under `t`, each tensor's
/// assignment appearing once, operands first.
pub fn forward_code(t: Tensor) -> HlCode {
    fn go(t: Tensor, out: &mut Vec<HlCode>, seen: &mut std::collections::HashSet<Tensor>) {
        if !seen.insert(t) {
            return;
        }
        for child in t.children() {
            go(child, out, seen);
        }
        out.push(t.forward());
    }
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    go(t, &mut out, &mut seen);
    crate::hlir::sequential(out)
}

/// The backward code of the whole subexpression under `t`: each node's
/// gradient assignments in reverse forward order.
pub fn backprop_code(t: Tensor) -> HlCode {
    fn order(t: Tensor, out: &mut Vec<Tensor>, seen: &mut std::collections::HashSet<Tensor>) {
        if !seen.insert(t) {
            return;
        }
        for child in t.children() {
            order(child, out, seen);
        }
        out.push(t);
    }
    let mut forward_order = Vec::new();
    let mut seen = std::collections::HashSet::new();
    order(t, &mut forward_order, &mut seen);
    let mut parts = Vec::new();
    for node in forward_order.into_iter().rev() {
        if let Some(diff) = node.diff() {
            parts.push(diff.backprop);
        }
    }
    crate::hlir::sequential(parts)
}

/// All gradient tensors reachable under `t`, in creation order.
pub fn reachable_grads(t: Tensor) -> Vec<Tensor> {
    fn go(t: Tensor, out: &mut Vec<Tensor>, seen: &mut std::collections::HashSet<Tensor>) {
        if !seen.insert(t) {
            return;
        }
        if let Some(g) = t.grad() {
            if !out.contains(&g) {
                out.push(g);
            }
        }
        for child in t.children() {
            go(child, out, seen);
        }
    }
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    go(t, &mut out, &mut seen);
    out.sort();
    out
}

/// Marks a tensor's value as visible to the host and returns its forward
/// block.
pub fn forward(t: Tensor) -> HlCode {
    t.require_mode(MemoryMode::Hosted);
    t.set_changed_on_devices(true);
    HlCode::block(&format!("{} fwd", t.label()), forward_code(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;

    #[test]
    fn parameters_are_differentiable_non_literal_leaves() {
        let x = data("ops_x", &[], &[3], InitOp::RangeOverOffsets).unwrap();
        let w = param("ops_w", &[]).unwrap();
        let c = mul("ops_wx", w, x).unwrap();
        let shifted = add("ops_wx1", c, scalar("ops_one", 1.0).unwrap()).unwrap();
        assert_eq!(parameters(shifted), vec![w]);
        assert!(shifted.diff().is_some());
        assert!(c.grad().is_some());
        assert!(x.grad().is_none());
    }

    #[test]
    fn shared_subexpressions_forward_once() {
        let x = data("ops_shared", &[], &[2], InitOp::RangeOverOffsets).unwrap();
        let two = scalar("ops_two", 2.0).unwrap();
        let d = mul("ops_d", two, x).unwrap();
        // d feeds both operands; its assignment must appear once.
        let s = add("ops_dd", d, d).unwrap();
        let rendered = format!("{}", forward_code(s));
        let d_writes = rendered
            .lines()
            .filter(|l| l.contains(" mul ") && l.contains(&format!(" t{} ", d.0)))
            .count();
        assert_eq!(d_writes, 1, "{rendered}");
        let s_writes = rendered
            .lines()
            .filter(|l| l.contains(" add ") && l.contains(&format!(" t{} ", s.0)))
            .count();
        assert_eq!(s_writes, 1, "{rendered}");
    }

    #[test]
    fn einsum_result_shape_follows_the_spec() {
        let a = Term::new("ops_ein_a")
            .batch(shape::RowSpec::Fixed(vec![2]))
            .output(shape::RowSpec::Fixed(vec![3]))
            .init(InitOp::RangeOverOffsets)
            .build()
            .unwrap();
        let b = Term::new("ops_ein_b")
            .batch(shape::RowSpec::Fixed(vec![2]))
            .output(shape::RowSpec::Fixed(vec![3]))
            .init(InitOp::RangeOverOffsets)
            .build()
            .unwrap();
        let dot = einsum("ops_dot", "...|->o; ...|->o => |->", a, b).unwrap();
        shape::finish_inference().unwrap();
        assert_eq!(dot.dims().unwrap(), Vec::<usize>::new());
    }
}
