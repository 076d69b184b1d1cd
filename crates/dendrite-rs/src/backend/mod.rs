//! The backend-agnostic execution contract.
//!
//! A backend owns devices; a context ties compiled code and device buffers to
//! one device; a routine schedules work onto its context's device. Host
//! transfer returns `false` rather than erroring for non-context or
//! non-hosted tensors, so callers can iterate over all referenced tensors
//! uniformly.

pub mod pipeline;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::indexing::Bindings;
use crate::llir::Binop;
use crate::optimize::OptimizedProgram;
use crate::scheduler::WorkerQueue;
use crate::tensor::Tensor;

/// Backend failures carrying the original diagnostic.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("unknown backend \"{name}\"; known: {known}")]
    UnknownBackend { name: String, known: String },
    #[error("compiling \"{routine}\": {diagnostic}")]
    Compile { routine: String, diagnostic: String },
    #[error("device {ordinal} is out of range ({available} available)")]
    NoSuchDevice { ordinal: usize, available: usize },
    #[error("{message}")]
    Execution { message: String },
}

/// An opaque hardware endpoint owning a worker thread and a mailbox.
pub trait Device: Send + Sync {
    fn ordinal(&self) -> usize;
    fn queue(&self) -> &WorkerQueue;
    fn as_any(&self) -> &dyn Any;
}

/// A compiled-code container tied to a single device; owns device buffers and
/// the loaded module. Dropping the last reference releases both.
pub trait Context: Send + Sync {
    fn device(&self) -> Arc<dyn Device>;
    fn as_any(&self) -> &dyn Any;
}

/// A closure that, when invoked, enqueues a compiled kernel launch on the
/// context's device.
#[derive(Clone)]
pub struct Work {
    device: Arc<dyn Device>,
    task: Arc<dyn Fn() -> Result<()> + Send + Sync>,
}

impl Work {
    pub fn new(device: Arc<dyn Device>, task: Arc<dyn Fn() -> Result<()> + Send + Sync>) -> Work {
        Work { device, task }
    }

    /// Enqueues the kernel; completion requires awaiting the device.
    pub fn run(&self) -> Result<()> {
        self.device.queue().submit(self.task.clone())
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

/// A compiled kernel bound to its context.
pub trait Routine: Send + Sync {
    fn name(&self) -> &str;
    fn bindings(&self) -> &Bindings;
    fn context(&self) -> Arc<dyn Context>;
    fn schedule(&self) -> Work;
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}

/// The fixed set of operations every backend provides.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process-wide lifecycle.
    fn initialize(&self) -> Result<()>;
    fn is_initialized(&self) -> bool;
    /// Releases device resources; callers must have joined all workers.
    fn unsafe_cleanup(&self) -> Result<()>;

    fn num_devices(&self) -> usize;
    fn get_device(&self, ordinal: usize) -> Result<Arc<dyn Device>>;

    fn init(&self, device: Arc<dyn Device>) -> Result<Arc<dyn Context>>;
    fn finalize(&self, ctx: Arc<dyn Context>);

    /// Compiles an optimized program plus static bindings into a routine on
    /// the context. Must not race with running work on the same context; may
    /// allocate device buffers on first compile of a tensor.
    fn compile(
        &self,
        ctx: &Arc<dyn Context>,
        name: &str,
        bindings: &Bindings,
        program: &OptimizedProgram,
    ) -> Result<Arc<dyn Routine>>;

    /// Copies the host buffer to the context; false when the tensor is not
    /// hosted or not present in the context. Potentially asynchronous.
    fn from_host(&self, ctx: &Arc<dyn Context>, t: Tensor) -> Result<bool>;

    /// Copies the context's buffer to the host; same contract as `from_host`.
    fn to_host(&self, ctx: &Arc<dyn Context>, t: Tensor) -> Result<bool>;

    /// Compiles `dst = accum(dst, src)` for `t`, pulling from the source
    /// context. `None` when the backend has no device path for this tensor;
    /// the host buffer may be used as staging, leaving host state undefined.
    fn merge(
        &self,
        t: Tensor,
        dst: &Arc<dyn Context>,
        accum: Binop,
        src: &Arc<dyn Context>,
        name_suffix: Option<&str>,
    ) -> Result<Option<Arc<dyn Routine>>>;

    /// Blocks until the device's queue is drained.
    fn await_device(&self, device: &Arc<dyn Device>) -> Result<()> {
        device.queue().await_idle()
    }

    fn to_ordinal(&self, device: &Arc<dyn Device>) -> usize {
        device.ordinal()
    }

    fn get_ctx_device(&self, ctx: &Arc<dyn Context>) -> Arc<dyn Device> {
        ctx.device()
    }
}

static BACKENDS: Lazy<Mutex<HashMap<String, Arc<dyn Backend>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers a backend under its name; later registrations win.
pub fn register_backend(backend: Arc<dyn Backend>) {
    let mut map = BACKENDS.lock().unwrap();
    map.insert(backend.name().to_string(), backend);
}

/// Looks a backend up by name. Unknown names are a hard error naming the
/// recognized backends.
pub fn lookup_backend(name: &str) -> Result<Arc<dyn Backend>> {
    let map = BACKENDS.lock().unwrap();
    match map.get(name) {
        Some(b) => Ok(b.clone()),
        None => {
            let mut known: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
            known.sort_unstable();
            Err(BackendError::UnknownBackend {
                name: name.to_string(),
                known: if known.is_empty() { "none registered".to_string() } else { known.join(", ") },
            }
            .into())
        }
    }
}

/// Selects the backend named by the `backend` preference (command line, then
/// environment), defaulting to `cpu-jit`. The named backend must already be
/// registered; an unknown name is a hard error.
pub fn backend_from_config() -> Result<Arc<dyn Backend>> {
    let name = crate::config::get_global_arg("backend", "cpu-jit");
    lookup_backend(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_names_are_a_hard_error() {
        let err = lookup_backend("no-such-backend").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unknown backend \"no-such-backend\""), "{msg}");
    }

    #[test]
    fn config_selection_defaults_to_cpu_jit() {
        // Nothing is registered in this crate's tests, so the default name
        // surfaces in the lookup error.
        let err = backend_from_config().unwrap_err();
        assert!(err.to_string().contains("cpu-jit"), "{err}");
    }
}
