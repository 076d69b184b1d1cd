//! Shapes as batch/input/output rows of dims, and the inference environment.
//!
//! A shape holds one row per axis kind. Rows end in a terminator: a row
//! variable (unknown leading axes), `Broadcastable` (any leading axes accepted)
//! or `Fixed` (the listed axes and nothing else). Dims are either concrete
//! sizes carrying a projection-class id, or dim variables filled by
//! unification.

pub mod labels;
pub mod project;
pub mod unify;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::indexing::ProjId;

/// The three axis kinds; a shape has one row per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisKind {
    Batch,
    Input,
    Output,
}

impl fmt::Display for AxisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisKind::Batch => f.write_str("batch"),
            AxisKind::Input => f.write_str("input"),
            AxisKind::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimVarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowVarId(pub u32);

static SHAPE_IDS: AtomicU32 = AtomicU32::new(0);
static DIM_VAR_IDS: AtomicU32 = AtomicU32::new(0);
static ROW_VAR_IDS: AtomicU32 = AtomicU32::new(0);

impl DimVarId {
    pub fn fresh() -> DimVarId {
        DimVarId(DIM_VAR_IDS.fetch_add(1, Ordering::Relaxed))
    }
}

impl RowVarId {
    pub fn fresh() -> RowVarId {
        RowVarId(ROW_VAR_IDS.fetch_add(1, Ordering::Relaxed))
    }
}

/// A dim variable awaiting unification.
#[derive(Debug, Clone, PartialEq)]
pub struct DimVar {
    pub id: DimVarId,
    pub label: Option<String>,
}

/// A concrete dim with its projection equivalence class.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedDim {
    pub size: usize,
    pub proj: ProjId,
    pub label: Option<String>,
}

/// One axis extent of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Dim {
    Var(DimVar),
    Sized(SizedDim),
}

/// Fresh unlabeled concrete dim.
pub fn dim(size: usize) -> Dim {
    Dim::Sized(SizedDim { size, proj: ProjId::fresh(), label: None })
}

/// Fresh labeled concrete dim.
pub fn labeled_dim(size: usize, label: &str) -> Dim {
    Dim::Sized(SizedDim { size, proj: ProjId::fresh(), label: Some(label.to_string()) })
}

/// Fresh unlabeled dim variable.
pub fn dim_var() -> Dim {
    Dim::Var(DimVar { id: DimVarId::fresh(), label: None })
}

impl Dim {
    pub fn size(&self) -> Option<usize> {
        match self {
            Dim::Sized(d) => Some(d.size),
            Dim::Var(_) => None,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Dim::Sized(d) => d.label.as_deref(),
            Dim::Var(v) => v.label.as_deref(),
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Var(v) => match &v.label {
                Some(l) => write!(f, "${l}"),
                None => write!(f, "$d{}", v.id.0),
            },
            Dim::Sized(d) => match &d.label {
                Some(l) => write!(f, "{}:{l}", d.size),
                None => write!(f, "{}", d.size),
            },
        }
    }
}

/// How a row may extend to the left of its listed dims.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RowTerminator {
    /// Unknown leading axes, to be solved.
    RowVar(RowVarId),
    /// Any leading axes are accepted (broadcast closure).
    Broadcastable,
    /// Exactly the listed axes.
    Fixed,
}

/// An optional constraint on the product of a row's dims.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RowConstraint {
    Unconstrained,
    TotalElems(usize),
}

/// An ordered list of dims with a terminator and a constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub dims: Vec<Dim>,
    pub constr: RowConstraint,
    pub term: RowTerminator,
}

impl Row {
    pub fn fixed(dims: Vec<Dim>) -> Row {
        Row { dims, constr: RowConstraint::Unconstrained, term: RowTerminator::Fixed }
    }

    pub fn broadcastable(dims: Vec<Dim>) -> Row {
        Row { dims, constr: RowConstraint::Unconstrained, term: RowTerminator::Broadcastable }
    }

    pub fn open(var: RowVarId, dims: Vec<Dim>) -> Row {
        Row { dims, constr: RowConstraint::Unconstrained, term: RowTerminator::RowVar(var) }
    }

    /// Whether the row is a bare row variable.
    pub fn is_bare_var(&self) -> Option<RowVarId> {
        match self.term {
            RowTerminator::RowVar(v) if self.dims.is_empty() => Some(v),
            _ => None,
        }
    }

    /// Concrete sizes, when every dim is sized.
    pub fn sizes(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(|d| d.size()).collect()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.term {
            RowTerminator::RowVar(v) => write!(f, "..r{}..,", v.0)?,
            RowTerminator::Broadcastable => write!(f, "...,")?,
            RowTerminator::Fixed => {}
        }
        for (n, d) in self.dims.iter().enumerate() {
            if n > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        if let RowConstraint::TotalElems(n) = self.constr {
            write!(f, " (total {n})")?;
        }
        Ok(())
    }
}

/// A shape: three rows plus a stable id and a debug name.
#[derive(Debug, Clone)]
pub struct Shape {
    pub id: ShapeId,
    pub batch: Row,
    pub input: Row,
    pub output: Row,
    pub debug_name: String,
}

impl Shape {
    pub fn row(&self, kind: AxisKind) -> &Row {
        match kind {
            AxisKind::Batch => &self.batch,
            AxisKind::Input => &self.input,
            AxisKind::Output => &self.output,
        }
    }

    pub fn row_mut(&mut self, kind: AxisKind) -> &mut Row {
        match kind {
            AxisKind::Batch => &mut self.batch,
            AxisKind::Input => &mut self.input,
            AxisKind::Output => &mut self.output,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} | {} -> {}]", self.debug_name, self.batch, self.input, self.output)
    }
}

/// How a row is specified at shape creation.
#[derive(Debug, Clone)]
pub enum RowSpec {
    /// Exactly these sizes.
    Fixed(Vec<usize>),
    /// Exactly these sizes with axis labels; the labels `task_id` and
    /// `sample_n` dedicate the axis to its scheduling role.
    LabeledFixed(Vec<(usize, String)>),
    /// These sizes, open to broadcast on the left.
    Bcast(Vec<usize>),
    /// Unknown, to be inferred.
    Var,
}

impl RowSpec {
    fn into_row(self) -> Row {
        match self {
            RowSpec::Fixed(sizes) => Row::fixed(sizes.into_iter().map(dim).collect()),
            RowSpec::LabeledFixed(sizes) => Row::fixed(
                sizes.into_iter().map(|(size, label)| labeled_dim(size, &label)).collect(),
            ),
            RowSpec::Bcast(sizes) => Row::broadcastable(sizes.into_iter().map(dim).collect()),
            RowSpec::Var => Row::open(RowVarId::fresh(), vec![]),
        }
    }
}

/// Transpose-family logics: one operand.
#[derive(Debug, Clone, PartialEq)]
pub enum TransposeKind {
    /// Swap the input and output rows.
    TransposeIO,
    /// Keep all rows equal to the operand's.
    Pointwise,
    /// Relabel axes per an axis-labels spec (`"rhs => lhs"`).
    Permute(String),
}

/// Broadcast-family logics: two operands.
#[derive(Debug, Clone, PartialEq)]
pub enum ComposeKind {
    /// All rows equal across the three shapes, with broadcasting.
    Pointwise,
    /// Function composition: output from the left operand, input from the
    /// right, contracting the left input against the right output.
    Compose,
    /// Generalized contraction per an einsum spec (`"rhs1;rhs2 => lhs"`).
    Einsum(String),
}

/// The shape-propagation logic of one tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Logic {
    /// A leaf; `total_elems` is known for strict fills and mapped files.
    Terminal { total_elems: Option<usize> },
    Transpose(TransposeKind, ShapeId),
    Broadcast(ComposeKind, ShapeId, ShapeId),
}

/// One retained propagation step: fill the shape's variables from its logic.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStep {
    pub shape: ShapeId,
    pub logic: Logic,
}

/// A structured record of one mismatch met while unification unwound.
#[derive(Debug, Clone)]
pub enum TraceFrame {
    Shape(String),
    Row(String, String),
    Dim(String, String),
    Index(String),
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceFrame::Shape(s) => write!(f, "shape {s}"),
            TraceFrame::Row(a, b) => write!(f, "row {a} vs {b}"),
            TraceFrame::Dim(a, b) => write!(f, "dim {a} vs {b}"),
            TraceFrame::Index(s) => write!(f, "index {s}"),
        }
    }
}

/// Shape-inference failure: a `/`-joined message stack naming the failing
/// sub-problems, plus the trace of participating shapes, rows and dims.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ShapeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl ShapeError {
    pub fn new(message: impl Into<String>) -> ShapeError {
        ShapeError { message: message.into(), trace: Vec::new() }
    }

    /// Prepends a context segment to the message stack.
    pub fn in_context(mut self, ctx: &str) -> ShapeError {
        self.message = format!("{ctx} / {}", self.message);
        self
    }

    pub fn with_frame(mut self, frame: TraceFrame) -> ShapeError {
        self.trace.push(frame);
        self
    }
}

/// The process-wide inference environment: shapes by id, the substitutions
/// accumulated so far, the broadcast-protected variable sets, and the retained
/// update steps.
#[derive(Debug, Default)]
pub struct ShapeEnv {
    pub(crate) shapes: HashMap<ShapeId, Shape>,
    pub(crate) dim_subst: HashMap<DimVarId, Dim>,
    pub(crate) row_subst: HashMap<RowVarId, Row>,
    pub(crate) broadcast_dim_vars: HashSet<DimVarId>,
    pub(crate) broadcast_row_vars: HashSet<RowVarId>,
    pub(crate) updates: Vec<UpdateStep>,
}

pub(crate) static SHAPE_ENV: Lazy<Mutex<ShapeEnv>> = Lazy::new(|| Mutex::new(ShapeEnv::default()));

/// Creates and registers a shape from row specs.
pub fn make_shape(debug_name: &str, batch: RowSpec, input: RowSpec, output: RowSpec) -> ShapeId {
    let id = ShapeId(SHAPE_IDS.fetch_add(1, Ordering::Relaxed));
    let shape = Shape {
        id,
        batch: batch.into_row(),
        input: input.into_row(),
        output: output.into_row(),
        debug_name: debug_name.to_string(),
    };
    let mut env = SHAPE_ENV.lock().unwrap();
    env.shapes.insert(id, shape);
    id
}

/// Snapshot of a registered shape.
pub fn get_shape(id: ShapeId) -> Shape {
    let env = SHAPE_ENV.lock().unwrap();
    env.shapes.get(&id).cloned().unwrap_or_else(|| panic!("unregistered shape {id:?}"))
}

/// Propagates an update step once and retains it for re-propagation during
/// [`finish_inference`]. Failed steps are not retained.
pub fn propagate_shapes(step: UpdateStep) -> Result<(), ShapeError> {
    let mut env = SHAPE_ENV.lock().unwrap();
    unify::propagate(&mut env, &step)?;
    env.updates.push(step);
    Ok(())
}

/// The dims of a shape in storage order: batch, then output, then input.
///
/// Fails with a precise error when any variable remains unresolved.
pub fn to_dims(id: ShapeId) -> Result<Vec<usize>, ShapeError> {
    let env = SHAPE_ENV.lock().unwrap();
    project::to_dims_in(&env, id)
}

/// Re-propagates retained updates and closes remaining broadcast variables.
pub fn finish_inference() -> Result<(), ShapeError> {
    let mut env = SHAPE_ENV.lock().unwrap();
    project::finish_inference_in(&mut env)
}

/// Derives the loop plan of an update step; all participating shapes must be
/// fully inferred by now.
pub fn derive_projections(step: &UpdateStep) -> Result<crate::indexing::Projections, ShapeError> {
    let mut env = SHAPE_ENV.lock().unwrap();
    project::derive_projections_in(&mut env, step)
}
