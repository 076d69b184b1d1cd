//! The compile pipeline: lowering, optimization, debug artifacts, backend
//! compilation.

use std::fs;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use log::debug;

use crate::config;
use crate::hlir::HlCode;
use crate::indexing::Bindings;
use crate::lower;
use crate::optimize::{self, OptimizeSettings};

use super::{Backend, Context, Routine};

/// Lowers, optimizes and compiles a high-level block on the given context.
///
/// With `output_debug_files_in_run_directory` set, writes `<name>.hlc`,
/// `<name>-unoptimized.llc` and `<name>.llc` into the current directory.
pub fn compile_routine(
    backend: &Arc<dyn Backend>,
    ctx: &Arc<dyn Context>,
    name: &str,
    bindings: &Bindings,
    code: &HlCode,
) -> Result<Arc<dyn Routine>> {
    // Lowering derives projections, which requires completed inference.
    crate::shape::finish_inference().map_err(|e| anyhow::anyhow!("{e}"))?;
    let debug_files = config::output_debug_files_in_run_directory();
    if debug_files {
        fs::write(format!("{name}.hlc"), format!("{code}"))
            .with_context(|| format!("writing {name}.hlc"))?;
    }
    let lowered = lower::to_low_level(code).with_context(|| format!("lowering \"{name}\""))?;
    if debug_files {
        fs::write(format!("{name}-unoptimized.llc"), format!("{lowered}"))
            .with_context(|| format!("writing {name}-unoptimized.llc"))?;
    }
    let settings = OptimizeSettings::default();
    let program = optimize::optimize(&settings, &lowered)
        .with_context(|| format!("optimizing \"{name}\""))?;
    if debug_files {
        fs::write(format!("{name}.llc"), format!("{}", program.code))
            .with_context(|| format!("writing {name}.llc"))?;
    }
    debug!(
        "compiling \"{name}\" on {}:{} ({} tensors traced)",
        backend.name(),
        ctx.device().ordinal(),
        program.traced.len()
    );
    backend.compile(ctx, name, bindings, &program)
}
