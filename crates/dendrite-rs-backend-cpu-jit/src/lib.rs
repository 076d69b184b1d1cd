//! The `cpu-jit` backend: compiles optimized low-level programs into
//! executors over host memory, one worker thread per device.
//!
//! Every context owns plain host buffers keyed by tensor id; host transfer is
//! a synchronous byte copy. Merges read the source context's buffer directly.

mod jit;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use log::debug;

use dendrite_rs::backend::{Backend, BackendError, Context, Device, Routine, Work};
use dendrite_rs::buffer::{InitOp, NdBuffer};
use dendrite_rs::config;
use dendrite_rs::indexing::Bindings;
use dendrite_rs::llir::{self, Binop, LlCode};
use dendrite_rs::optimize::OptimizedProgram;
use dendrite_rs::scheduler::WorkerQueue;
use dendrite_rs::tensor::Tensor;

use jit::{BufRef, Executor};

pub struct CpuDevice {
    ordinal: usize,
    queue: Arc<WorkerQueue>,
}

impl Device for CpuDevice {
    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn queue(&self) -> &WorkerQueue {
        &self.queue
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct CpuContext {
    device: Arc<CpuDevice>,
    buffers: Mutex<HashMap<Tensor, BufRef>>,
}

impl Context for CpuContext {
    fn device(&self) -> Arc<dyn Device> {
        self.device.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct CpuRoutine {
    name: String,
    bindings: Bindings,
    ctx: Arc<dyn Context>,
    device: Arc<dyn Device>,
    executor: Arc<Executor>,
}

impl Routine for CpuRoutine {
    fn name(&self) -> &str {
        &self.name
    }

    fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    fn context(&self) -> Arc<dyn Context> {
        self.ctx.clone()
    }

    fn schedule(&self) -> Work {
        let executor = self.executor.clone();
        Work::new(self.device.clone(), Arc::new(move || executor.run()))
    }
}

pub struct CpuJitBackend {
    devices: Mutex<Vec<Arc<CpuDevice>>>,
    initialized: AtomicBool,
}

impl CpuJitBackend {
    pub fn new() -> CpuJitBackend {
        CpuJitBackend { devices: Mutex::new(Vec::new()), initialized: AtomicBool::new(false) }
    }

    fn downcast<'a>(&self, ctx: &'a Arc<dyn Context>) -> Result<&'a CpuContext> {
        ctx.as_any()
            .downcast_ref::<CpuContext>()
            .ok_or_else(|| BackendError::Execution {
                message: "context does not belong to cpu-jit".to_string(),
            }.into())
    }

    /// Ensures a context buffer exists for every tensor the program touches.
    fn prepare_buffers(&self, ctx: &CpuContext, code: &LlCode) -> Result<()> {
        let mut buffers = ctx.buffers.lock().unwrap();
        for t in llir::referenced_tensors(code) {
            if buffers.contains_key(&t) {
                continue;
            }
            let dims = t.dims()?;
            let buf = NdBuffer::create(
                t.precision(),
                &dims,
                &InitOp::ConstantFill { values: vec![0.0], strict: false },
            )
            .with_context(|| format!("allocating {} on device {}", t.header(), ctx.device.ordinal))?;
            buffers.insert(t, Arc::new(Mutex::new(buf)));
        }
        Ok(())
    }
}

impl Default for CpuJitBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuJitBackend {
    fn name(&self) -> &'static str {
        "cpu-jit"
    }

    fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let requested = config::get_global_int("cpu_jit_num_devices", 0);
        let count = if requested > 0 {
            requested as usize
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        };
        let mut devices = self.devices.lock().unwrap();
        for ordinal in 0..count {
            devices.push(Arc::new(CpuDevice {
                ordinal,
                queue: WorkerQueue::spawn(format!("cpu-jit:{ordinal}")),
            }));
        }
        debug!("cpu-jit initialized with {count} devices");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn unsafe_cleanup(&self) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        for device in devices.drain(..) {
            device.queue.shutdown();
        }
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn num_devices(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    fn get_device(&self, ordinal: usize) -> Result<Arc<dyn Device>> {
        let devices = self.devices.lock().unwrap();
        devices.get(ordinal).cloned().map(|d| d as Arc<dyn Device>).ok_or_else(|| {
            BackendError::NoSuchDevice { ordinal, available: devices.len() }.into()
        })
    }

    fn init(&self, device: Arc<dyn Device>) -> Result<Arc<dyn Context>> {
        let device = device
            .as_any()
            .downcast_ref::<CpuDevice>()
            .map(|d| {
                let devices = self.devices.lock().unwrap();
                devices[d.ordinal].clone()
            })
            .ok_or_else(|| BackendError::Execution {
                message: "device does not belong to cpu-jit".to_string(),
            })?;
        Ok(Arc::new(CpuContext { device, buffers: Mutex::new(HashMap::new()) }))
    }

    fn finalize(&self, ctx: Arc<dyn Context>) {
        if let Some(cpu) = ctx.as_any().downcast_ref::<CpuContext>() {
            cpu.buffers.lock().unwrap().clear();
        }
    }

    fn compile(
        &self,
        ctx: &Arc<dyn Context>,
        name: &str,
        bindings: &Bindings,
        program: &OptimizedProgram,
    ) -> Result<Arc<dyn Routine>> {
        let cpu = self.downcast(ctx)?;
        self.prepare_buffers(cpu, &program.code)?;
        let buffers = {
            let map = cpu.buffers.lock().unwrap();
            llir::referenced_tensors(&program.code)
                .into_iter()
                .map(|t| (t, map[&t].clone()))
                .collect()
        };
        let executor = Arc::new(Executor {
            name: name.to_string(),
            code: program.code.clone(),
            buffers,
            bindings: bindings.clone(),
        });
        Ok(Arc::new(CpuRoutine {
            name: name.to_string(),
            bindings: bindings.clone(),
            ctx: ctx.clone(),
            device: cpu.device.clone() as Arc<dyn Device>,
            executor,
        }))
    }

    fn from_host(&self, ctx: &Arc<dyn Context>, t: Tensor) -> Result<bool> {
        let cpu = self.downcast(ctx)?;
        if !t.is_hosted() {
            return Ok(false);
        }
        let buffers = cpu.buffers.lock().unwrap();
        let Some(dst) = buffers.get(&t) else { return Ok(false) };
        let bytes = t.with_host_buffer(|b| b.to_le_bytes())?;
        dst.lock().unwrap().copy_from_le_bytes(&bytes)?;
        Ok(true)
    }

    fn to_host(&self, ctx: &Arc<dyn Context>, t: Tensor) -> Result<bool> {
        let cpu = self.downcast(ctx)?;
        if !t.is_hosted() {
            return Ok(false);
        }
        let buffers = cpu.buffers.lock().unwrap();
        let Some(src) = buffers.get(&t) else { return Ok(false) };
        let bytes = src.lock().unwrap().to_le_bytes();
        t.with_host_buffer_mut(|b| b.copy_from_le_bytes(&bytes))?;
        Ok(true)
    }

    fn merge(
        &self,
        t: Tensor,
        dst: &Arc<dyn Context>,
        accum: Binop,
        src: &Arc<dyn Context>,
        name_suffix: Option<&str>,
    ) -> Result<Option<Arc<dyn Routine>>> {
        let dst_cpu = self.downcast(dst)?;
        let src_cpu = self.downcast(src)?;
        let dst_buf = dst_cpu.buffers.lock().unwrap().get(&t).cloned();
        let src_buf = src_cpu.buffers.lock().unwrap().get(&t).cloned();
        let (Some(dst_buf), Some(src_buf)) = (dst_buf, src_buf) else {
            return Ok(None);
        };
        let dims = t.dims()?;
        let size: usize = dims.iter().product();
        let name = format!("merge_{}{}", t.label(), name_suffix.unwrap_or(""));
        let header = t.header();
        let device = dst_cpu.device.clone();
        let task = Arc::new(move || -> Result<()> {
            // Fused `dst = accum(dst, src)` over the flat cell range.
            let src_values: Vec<f64> = {
                let src = src_buf.lock().unwrap();
                (0..size).map(|o| flat_get(&src, &dims, o)).collect::<Result<_>>()?
            };
            let mut dst_guard = dst_buf.lock().unwrap();
            for (offset, s) in src_values.into_iter().enumerate() {
                let d = flat_get(&dst_guard, &dims, offset)?;
                flat_set(&mut dst_guard, &dims, offset, accum.eval(d, s))
                    .with_context(|| format!("merging {header}"))?;
            }
            Ok(())
        });
        struct MergeRoutine {
            name: String,
            bindings: Bindings,
            ctx: Arc<dyn Context>,
            work: Work,
        }
        impl Routine for MergeRoutine {
            fn name(&self) -> &str {
                &self.name
            }
            fn bindings(&self) -> &Bindings {
                &self.bindings
            }
            fn context(&self) -> Arc<dyn Context> {
                self.ctx.clone()
            }
            fn schedule(&self) -> Work {
                self.work.clone()
            }
        }
        Ok(Some(Arc::new(MergeRoutine {
            name,
            bindings: Bindings::default(),
            ctx: dst.clone(),
            work: Work::new(device as Arc<dyn Device>, task),
        })))
    }
}

/// Registers the backend under its name and returns it.
pub fn register() -> Arc<CpuJitBackend> {
    let backend = Arc::new(CpuJitBackend::new());
    dendrite_rs::register_backend(backend.clone());
    backend
}

fn unflatten(dims: &[usize], mut offset: usize) -> Vec<usize> {
    let mut idcs = vec![0; dims.len()];
    for (n, &d) in dims.iter().enumerate().rev() {
        if d == 0 {
            return idcs;
        }
        idcs[n] = offset % d;
        offset /= d;
    }
    idcs
}

fn flat_get(buf: &NdBuffer, dims: &[usize], offset: usize) -> Result<f64> {
    buf.get_as_float(&unflatten(dims, offset))
}

fn flat_set(buf: &mut NdBuffer, dims: &[usize], offset: usize, v: f64) -> Result<()> {
    buf.set_from_float(&unflatten(dims, offset), v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unflatten_is_row_major() {
        assert_eq!(unflatten(&[2, 3], 0), vec![0, 0]);
        assert_eq!(unflatten(&[2, 3], 4), vec![1, 1]);
        assert_eq!(unflatten(&[2, 3], 5), vec![1, 2]);
    }
}
