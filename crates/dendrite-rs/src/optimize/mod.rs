//! Tracing, virtualization and simplification of low-level programs.
//!
//! The pipeline: a visit analysis interprets the loop nests and records which
//! cells each tensor writes and reads; virtualization inlines the definitions
//! of cheap tensors at their read sites; cleanup removes the inlined
//! definitions; and an algebraic simplifier rewrites the float sub-IR to a
//! fixpoint.

pub mod simplify;
pub mod virtualize;
pub mod visit;

use std::collections::HashMap;

use anyhow::Result;

use crate::config;
use crate::llir::{LlCode, LlExpr};
use crate::tensor::Tensor;

/// Optimizer knobs, read once from the config surface.
#[derive(Debug, Clone)]
pub struct OptimizeSettings {
    /// Keep device-only tensors off the host.
    pub enable_device_only: bool,
    /// Candidates visited more often than this are materialized instead.
    pub max_visits: usize,
    /// Replace reads of scalar-proven tensors with their literal.
    pub inline_constants: bool,
    /// Inline even when the definition sits under dynamic-provider indices.
    pub always_inline_dynamic_indexing: bool,
    /// When false, a sample-number dependency blocks replication.
    pub sequential_minibatch: bool,
    /// Unroll integer powers into product chains.
    pub optimize_integer_pow: bool,
    /// Loops longer than this are not iterated by the visit analysis.
    pub max_tracing_extent: usize,
}

impl Default for OptimizeSettings {
    fn default() -> Self {
        OptimizeSettings {
            enable_device_only: config::get_global_flag("enable_device_only", true),
            max_visits: config::get_global_int("max_visits", 3).max(0) as usize,
            inline_constants: config::get_global_flag("inline_constants", true),
            always_inline_dynamic_indexing: config::get_global_flag(
                "always_inline_dynamic_indexing",
                false,
            ),
            sequential_minibatch: config::get_global_flag("sequential_minibatch", false),
            optimize_integer_pow: config::get_global_flag("optimize_integer_pow", true),
            max_tracing_extent: config::get_global_int("max_tracing_extent", 64).max(1) as usize,
        }
    }
}

/// Access multiplicity of one index tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visits {
    Visits(usize),
    /// Read at that tuple before any assignment: the cell carries state.
    Recurrent,
}

/// The analysis record of one tensor in one program.
#[derive(Debug, Clone)]
pub struct TracedTensor {
    pub tensor: Tensor,
    /// Distinct index tuples written (symbolic under untraced loops).
    pub assignments: usize,
    /// Access multiplicity per distinct read tuple.
    pub accesses: Vec<Visits>,
    /// Proven unfit for inlining (hosted, escaping, demanded materialized).
    pub non_virtual: bool,
    /// Must exist on the host (read by host callbacks or demanded hosted).
    pub non_device_only: bool,
    /// The single constant this tensor provably holds, when size is 1.
    pub scalar: Option<f64>,
    /// First contact was a zero fill.
    pub zero_initialized: bool,
    /// Some zero fill occurs.
    pub zeroed_out: bool,
    /// Some cell is read before it is written.
    pub read_before_write: bool,
    /// Never written by this program.
    pub read_only: bool,
    /// The last write is not a read-modify-write of the same cell.
    pub last_write_non_update: bool,
    /// Target of a dynamic-indices slice.
    pub is_dynamic_slice: bool,
    /// May be duplicated across devices.
    pub is_replicable: bool,
    /// Distinct right-hand-side expressions assigned.
    pub rhs_set: Vec<LlExpr>,
}

impl TracedTensor {
    pub(crate) fn new(tensor: Tensor) -> Self {
        TracedTensor {
            tensor,
            assignments: 0,
            accesses: Vec::new(),
            non_virtual: false,
            non_device_only: false,
            scalar: None,
            zero_initialized: false,
            zeroed_out: false,
            read_before_write: false,
            read_only: true,
            last_write_non_update: false,
            is_dynamic_slice: false,
            is_replicable: true,
            rhs_set: Vec::new(),
        }
    }

    /// The largest visit count, or `None` when any access is recurrent.
    pub fn max_visits(&self) -> Option<usize> {
        let mut max = 0;
        for v in &self.accesses {
            match v {
                Visits::Recurrent => return None,
                Visits::Visits(n) => max = max.max(*n),
            }
        }
        Some(max)
    }
}

/// An optimized program with the traced facts of its final form.
#[derive(Debug)]
pub struct OptimizedProgram {
    pub code: LlCode,
    pub traced: HashMap<Tensor, TracedTensor>,
}

/// Runs the full pipeline on a lowered program.
pub fn optimize(settings: &OptimizeSettings, code: &LlCode) -> Result<OptimizedProgram> {
    let traced = visit::visit(settings, code);
    let code = virtualize::virtualize(settings, code, &traced);
    let code = simplify::simplify(settings, &code);
    // Re-trace so downstream consumers see the facts of the final program.
    let traced = visit::visit(settings, &code);
    Ok(OptimizedProgram { code, traced })
}
