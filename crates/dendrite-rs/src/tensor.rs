//! The process-wide tensor-node table.
//!
//! Nodes are created with monotonically increasing ids and live for the whole
//! session; the main thread is the only mutator. A node's dims are filled
//! lazily once shape inference resolves its shape; its memory mode may be
//! raised but never lowered once decided.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, ensure, Result};
use once_cell::sync::Lazy;

use crate::buffer::{InitOp, NdBuffer};
use crate::hlir::HlCode;
use crate::precision::Precision;
use crate::shape::{self, ShapeId};

/// Handle to a tensor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tensor(pub u32);

/// Where a tensor's value lives. Ordered from most to least restrictive;
/// a decided mode may be raised but never lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryMode {
    /// Writes are always inlined at read sites; never allocated anywhere.
    Virtual,
    /// Lives only in device memory.
    DeviceOnly,
    /// Allocated on devices, host copy not guaranteed.
    Materialized,
    /// Has a host buffer the host may read.
    Hosted,
}

/// Differentiation record attached to a differentiable tensor.
#[derive(Debug, Clone)]
pub struct Diff {
    pub grad: Tensor,
    pub backprop: HlCode,
    pub zero_grads: HlCode,
}

#[derive(Debug)]
pub(crate) struct Node {
    pub precision: Precision,
    pub label: String,
    pub shape: ShapeId,
    pub dims: Option<Vec<usize>>,
    pub mode: Option<MemoryMode>,
    pub changed_on_devices: bool,
    pub buffer: Option<NdBuffer>,
    pub init: Option<InitOp>,
    pub forward: HlCode,
    pub diff: Option<Diff>,
    pub literal: bool,
    pub value_distributes_over_sum: bool,
    pub children: Vec<Tensor>,
}

static REGISTRY: Lazy<Mutex<Vec<Node>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Registers a node and returns its handle. Ids are monotonically increasing.
pub(crate) fn register(node: Node) -> Tensor {
    let mut reg = REGISTRY.lock().unwrap();
    let id = reg.len() as u32;
    reg.push(node);
    Tensor(id)
}

pub(crate) fn with_node<R>(t: Tensor, f: impl FnOnce(&Node) -> R) -> R {
    let reg = REGISTRY.lock().unwrap();
    f(&reg[t.0 as usize])
}

pub(crate) fn with_node_mut<R>(t: Tensor, f: impl FnOnce(&mut Node) -> R) -> R {
    let mut reg = REGISTRY.lock().unwrap();
    f(&mut reg[t.0 as usize])
}

impl Tensor {
    pub fn label(self) -> String {
        with_node(self, |n| n.label.clone())
    }

    pub fn precision(self) -> Precision {
        with_node(self, |n| n.precision)
    }

    pub fn shape_id(self) -> ShapeId {
        with_node(self, |n| n.shape)
    }

    pub fn is_literal(self) -> bool {
        with_node(self, |n| n.literal)
    }

    pub fn forward(self) -> HlCode {
        with_node(self, |n| n.forward.clone())
    }

    pub fn diff(self) -> Option<Diff> {
        with_node(self, |n| n.diff.clone())
    }

    pub fn grad(self) -> Option<Tensor> {
        with_node(self, |n| n.diff.as_ref().map(|d| d.grad))
    }

    pub fn children(self) -> Vec<Tensor> {
        with_node(self, |n| n.children.clone())
    }

    pub fn memory_mode(self) -> Option<MemoryMode> {
        with_node(self, |n| n.mode)
    }

    pub fn changed_on_devices(self) -> bool {
        with_node(self, |n| n.changed_on_devices)
    }

    pub fn value_distributes_over_sum(self) -> bool {
        with_node(self, |n| n.value_distributes_over_sum)
    }

    /// Inferred dims in storage order (batch, output, input), cached after the
    /// first successful query.
    pub fn dims(self) -> Result<Vec<usize>> {
        if let Some(dims) = with_node(self, |n| n.dims.clone()) {
            return Ok(dims);
        }
        let shape = self.shape_id();
        let dims = shape::to_dims(shape).map_err(|e| anyhow!("{e}"))?;
        with_node_mut(self, |n| n.dims = Some(dims.clone()));
        Ok(dims)
    }

    /// Raises the memory mode; lowering an already decided mode is a no-op.
    pub fn require_mode(self, mode: MemoryMode) {
        with_node_mut(self, |n| match n.mode {
            Some(cur) if cur >= mode => {}
            _ => n.mode = Some(mode),
        });
    }

    pub fn set_changed_on_devices(self, changed: bool) {
        with_node_mut(self, |n| n.changed_on_devices = changed);
    }

    /// Whether the node currently owns a host buffer.
    pub fn is_hosted(self) -> bool {
        with_node(self, |n| n.buffer.is_some())
    }

    /// Allocates the host buffer from the node's init op if absent.
    ///
    /// Virtual tensors never acquire a buffer; demanding one is an invariant
    /// violation.
    pub fn ensure_host_buffer(self) -> Result<()> {
        if self.is_hosted() {
            return Ok(());
        }
        ensure!(
            self.memory_mode() != Some(MemoryMode::Virtual),
            "virtual tensor {} cannot acquire a host buffer",
            self.label()
        );
        let dims = self.dims()?;
        let precision = self.precision();
        let init = with_node(self, |n| n.init.clone())
            .unwrap_or(InitOp::ConstantFill { values: vec![0.0], strict: false });
        let buffer = NdBuffer::create(precision, &dims, &init)?;
        with_node_mut(self, |n| n.buffer = Some(buffer));
        Ok(())
    }

    /// Read access to the host buffer.
    pub fn with_host_buffer<R>(self, f: impl FnOnce(&NdBuffer) -> R) -> Result<R> {
        let reg = REGISTRY.lock().unwrap();
        let node = &reg[self.0 as usize];
        match &node.buffer {
            Some(buf) => Ok(f(buf)),
            None => bail!("tensor {} is not hosted", node.label),
        }
    }

    /// Write access to the host buffer.
    pub fn with_host_buffer_mut<R>(self, f: impl FnOnce(&mut NdBuffer) -> Result<R>) -> Result<R> {
        let mut reg = REGISTRY.lock().unwrap();
        let node = &mut reg[self.0 as usize];
        match &mut node.buffer {
            Some(buf) => f(buf),
            None => bail!("tensor {} is not hosted", node.label),
        }
    }

    /// A short header naming the tensor, for runtime error messages.
    pub fn header(self) -> String {
        with_node(self, |n| {
            let dims = n
                .dims
                .as_ref()
                .map(|d| format!("{d:?}"))
                .unwrap_or_else(|| "?".to_string());
            format!("#{} \"{}\" {} {}", self.0, n.label, n.precision, dims)
        })
    }
}

static SESSION_STEP: AtomicI64 = AtomicI64::new(0);

/// The current session step, fed to host-callback fetches.
pub fn session_step() -> i64 {
    SESSION_STEP.load(Ordering::SeqCst)
}

/// Advances the session step; called after each scheduled forward run.
pub fn advance_session_step() -> i64 {
    SESSION_STEP.fetch_add(1, Ordering::SeqCst) + 1
}

/// Used by scenario tests that pin the starting step.
pub fn set_session_step(step: i64) {
    SESSION_STEP.store(step, Ordering::SeqCst);
}
