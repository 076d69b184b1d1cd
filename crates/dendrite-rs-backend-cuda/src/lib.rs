//! The `cuda` backend: NVRTC-compiled kernels over the dynamically loaded
//! driver API, one worker thread per device.
//!
//! Parameter merges across contexts stage through host memory (the tensor's
//! host buffer contents are undefined afterwards). When the driver library is
//! absent, `initialize` fails and the code generator remains usable.

pub mod codegen;
mod driver;
mod nvrtc;

use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context as _, Result};
use log::debug;

use dendrite_rs::backend::{Backend, BackendError, Context, Device, Routine, Work};
use dendrite_rs::config;
use dendrite_rs::indexing::Bindings;
use dendrite_rs::llir::{self, Binop};
use dendrite_rs::optimize::OptimizedProgram;
use dendrite_rs::precision::Precision;
use dendrite_rs::scheduler::WorkerQueue;
use dendrite_rs::tensor::Tensor;

use codegen::{KernelParam, KernelSource};
use driver::{CudaDriver, DeviceBuffer, KernelFunction, OwnedContext, OwnedModule};

pub struct CudaDevice {
    ordinal: usize,
    queue: Arc<WorkerQueue>,
}

impl Device for CudaDevice {
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

pub struct CudaContext {
    device: Arc<CudaDevice>,
    cu: Arc<CudaDriver>,
    raw: OwnedContext,
    buffers: Mutex<HashMap<Tensor, DeviceBuffer>>,
    /// Scratch allocations owned by merge routines.
    staging: Mutex<Vec<DeviceBuffer>>,
    modules: Mutex<Vec<OwnedModule>>,
}

impl Context for CudaContext {
    fn device(&self) -> Arc<dyn Device> {
        self.device.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        // Release device buffers, then unload modules, then the context.
        if self.cu.set_current(&self.raw).is_ok() {
            for buffer in self.buffers.lock().unwrap().values() {
                self.cu.free(buffer);
            }
            for buffer in self.staging.lock().unwrap().iter() {
                self.cu.free(buffer);
            }
            for module in self.modules.lock().unwrap().iter() {
                self.cu.unload_module(module);
            }
        }
        self.cu.destroy_context(&self.raw);
    }
}

/// The launchable core of a compiled kernel, shared by scheduled work items.
struct LaunchCore {
    name: String,
    bindings: Bindings,
    ctx: Arc<dyn Context>,
    cu: Arc<CudaDriver>,
    function: Arc<KernelFunction>,
    params: Vec<KernelParam>,
    buffers: HashMap<Tensor, DeviceBuffer>,
}

impl LaunchCore {
    fn launch(&self) -> Result<()> {
        let cuda = self
            .ctx
            .as_any()
            .downcast_ref::<CudaContext>()
            .ok_or_else(|| anyhow!("cuda routine bound to a foreign context"))?;
        self.cu.set_current(&cuda.raw)?;
        // Bindings are read here, at launch.
        let mut ptr_storage: Vec<u64> = Vec::new();
        let mut int_storage: Vec<i64> = Vec::new();
        for param in &self.params {
            match param {
                KernelParam::Buffer(t) => ptr_storage.push(self.buffers[t].ptr),
                KernelParam::Binding(sym) => {
                    let binding = self
                        .bindings
                        .lookup(*sym)
                        .ok_or_else(|| anyhow!("binding {sym} disappeared before launch"))?;
                    int_storage.push(binding.get());
                }
            }
        }
        let mut raw_params: Vec<*mut c_void> = Vec::with_capacity(self.params.len());
        let mut ptr_iter = ptr_storage.iter_mut();
        let mut int_iter = int_storage.iter_mut();
        for param in &self.params {
            match param {
                KernelParam::Buffer(_) => {
                    raw_params.push(ptr_iter.next().unwrap() as *mut u64 as *mut c_void)
                }
                KernelParam::Binding(_) => {
                    raw_params.push(int_iter.next().unwrap() as *mut i64 as *mut c_void)
                }
            }
        }
        self.cu
            .launch(&self.function, &mut raw_params)
            .with_context(|| format!("launching \"{}\"", self.name))?;
        self.cu.synchronize()
    }
}

struct CudaRoutine {
    core: Arc<LaunchCore>,
    device: Arc<CudaDevice>,
}

impl Routine for CudaRoutine {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn bindings(&self) -> &Bindings {
        &self.core.bindings
    }

    fn context(&self) -> Arc<dyn Context> {
        self.core.ctx.clone()
    }

    fn schedule(&self) -> Work {
        let core = self.core.clone();
        Work::new(self.device.clone() as Arc<dyn Device>, Arc::new(move || core.launch()))
    }
}

pub struct CudaBackend {
    devices: Mutex<Vec<Arc<CudaDevice>>>,
    initialized: AtomicBool,
}

impl CudaBackend {
    pub fn new() -> CudaBackend {
        CudaBackend { devices: Mutex::new(Vec::new()), initialized: AtomicBool::new(false) }
    }

    fn downcast<'a>(&self, ctx: &'a Arc<dyn Context>) -> Result<&'a CudaContext> {
        ctx.as_any().downcast_ref::<CudaContext>().ok_or_else(|| {
            BackendError::Execution { message: "context does not belong to cuda".to_string() }
                .into()
        })
    }

    fn compile_source(
        &self,
        cuda: &CudaContext,
        kernel: &KernelSource,
        routine_name: &str,
    ) -> Result<Arc<KernelFunction>> {
        let rtc = nvrtc::nvrtc()?;
        let debug_files = config::output_debug_files_in_run_directory();
        if debug_files {
            fs::write(format!("{routine_name}-cudajit-debug.cu"), &kernel.source)?;
        }
        let compiled = rtc.compile(&kernel.name, &kernel.source).map_err(|e| {
            BackendError::Compile { routine: routine_name.to_string(), diagnostic: format!("{e:#}") }
        })?;
        if debug_files {
            fs::write(format!("{routine_name}.ptx"), &compiled.ptx)?;
            fs::write(format!("{routine_name}.cu_log"), &compiled.log)?;
        }
        self.downcast_driver(cuda)?;
        let module = cuda.cu.load_module(&compiled.ptx)?;
        let function = cuda.cu.get_function(&module, &kernel.name)?;
        cuda.modules.lock().unwrap().push(module);
        Ok(Arc::new(function))
    }

    fn downcast_driver(&self, cuda: &CudaContext) -> Result<()> {
        cuda.cu.set_current(&cuda.raw)
    }

    /// Allocates a zeroed device buffer per referenced tensor.
    fn prepare_buffers(&self, cuda: &CudaContext, tensors: &[Tensor]) -> Result<()> {
        self.downcast_driver(cuda)?;
        let mut buffers = cuda.buffers.lock().unwrap();
        for &t in tensors {
            if buffers.contains_key(&t) {
                continue;
            }
            let dims = t.dims()?;
            let bytes = dims.iter().product::<usize>() * t.precision().size_in_bytes();
            let buffer = cuda
                .cu
                .alloc(bytes)
                .with_context(|| format!("allocating {} on cuda:{}", t.header(), cuda.device.ordinal))?;
            cuda.cu.memset_zero(&buffer)?;
            buffers.insert(t, buffer);
        }
        Ok(())
    }
}

impl Default for CudaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let cu = driver::driver()?;
        let count = cu.device_count()?;
        let mut devices = self.devices.lock().unwrap();
        for ordinal in 0..count {
            devices.push(Arc::new(CudaDevice {
                ordinal,
                queue: WorkerQueue::spawn(format!("cuda:{ordinal}")),
            }));
        }
        self.initialized.store(true, Ordering::SeqCst);
        debug!("cuda initialized with {count} devices");
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
        let cu = driver::driver()?;
        let device = {
            let ordinal = device
                .as_any()
                .downcast_ref::<CudaDevice>()
                .ok_or_else(|| BackendError::Execution {
                    message: "device does not belong to cuda".to_string(),
                })?
                .ordinal;
            self.devices.lock().unwrap()[ordinal].clone()
        };
        let raw = cu.create_context(device.ordinal)?;
        Ok(Arc::new(CudaContext {
            device,
            cu,
            raw,
            buffers: Mutex::new(HashMap::new()),
            staging: Mutex::new(Vec::new()),
            modules: Mutex::new(Vec::new()),
        }))
    }

    fn finalize(&self, ctx: Arc<dyn Context>) {
        drop(ctx);
    }

    fn compile(
        &self,
        ctx: &Arc<dyn Context>,
        name: &str,
        bindings: &Bindings,
        program: &OptimizedProgram,
    ) -> Result<Arc<dyn Routine>> {
        let cuda = self.downcast(ctx)?;
        let kernel = codegen::emit_kernel(name, &program.code, bindings)?;
        let tensors = llir::referenced_tensors(&program.code);
        self.prepare_buffers(cuda, &tensors)?;
        let function = self.compile_source(cuda, &kernel, name)?;
        let buffers = {
            let map = cuda.buffers.lock().unwrap();
            tensors.iter().map(|&t| (t, map[&t])).collect()
        };
        Ok(Arc::new(CudaRoutine {
            core: Arc::new(LaunchCore {
                name: name.to_string(),
                bindings: bindings.clone(),
                ctx: ctx.clone(),
                cu: cuda.cu.clone(),
                function,
                params: kernel.params,
                buffers,
            }),
            device: cuda.device.clone(),
        }))
    }

    fn from_host(&self, ctx: &Arc<dyn Context>, t: Tensor) -> Result<bool> {
        let cuda = self.downcast(ctx)?;
        if !t.is_hosted() {
            return Ok(false);
        }
        let buffers = cuda.buffers.lock().unwrap();
        let Some(dst) = buffers.get(&t) else { return Ok(false) };
        let bytes = t.with_host_buffer(|b| b.to_le_bytes())?;
        self.downcast_driver(cuda)?;
        cuda.cu.copy_to_device(dst, &bytes)?;
        Ok(true)
    }

    fn to_host(&self, ctx: &Arc<dyn Context>, t: Tensor) -> Result<bool> {
        let cuda = self.downcast(ctx)?;
        if !t.is_hosted() {
            return Ok(false);
        }
        let buffers = cuda.buffers.lock().unwrap();
        let Some(src) = buffers.get(&t) else { return Ok(false) };
        let mut bytes = vec![0u8; src.bytes];
        self.downcast_driver(cuda)?;
        cuda.cu.copy_to_host(src, &mut bytes)?;
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
        let dst_cuda = self.downcast(dst)?;
        let src_cuda = self.downcast(src)?;
        let dst_buf = dst_cuda.buffers.lock().unwrap().get(&t).copied();
        let src_buf = src_cuda.buffers.lock().unwrap().get(&t).copied();
        let (Some(dst_buf), Some(src_buf)) = (dst_buf, src_buf) else {
            return Ok(None);
        };

        let size: usize = t.dims()?.iter().product();
        let name = format!("merge_{}{}", t.label(), name_suffix.unwrap_or(""));
        let kernel = merge_kernel_source(&name, t.precision(), size, accum);
        // Staging buffer on the destination context; the transfer goes
        // device -> host -> device.
        self.downcast_driver(dst_cuda)?;
        let staging = dst_cuda.cu.alloc(src_buf.bytes)?;
        dst_cuda.staging.lock().unwrap().push(staging);
        let function = self.compile_source(dst_cuda, &kernel, &name)?;

        let cu = dst_cuda.cu.clone();
        let src_ctx = src.clone();
        let dst_ctx = dst.clone();
        let device = dst_cuda.device.clone();
        let task = Arc::new(move || -> Result<()> {
            let src_cuda = src_ctx
                .as_any()
                .downcast_ref::<CudaContext>()
                .ok_or_else(|| anyhow!("merge source is not a cuda context"))?;
            let dst_cuda = dst_ctx
                .as_any()
                .downcast_ref::<CudaContext>()
                .ok_or_else(|| anyhow!("merge destination is not a cuda context"))?;
            let mut bytes = vec![0u8; src_buf.bytes];
            cu.set_current(&src_cuda.raw)?;
            cu.copy_to_host(&src_buf, &mut bytes)?;
            cu.synchronize()?;
            cu.set_current(&dst_cuda.raw)?;
            cu.copy_to_device(&staging, &bytes)?;
            let mut dst_ptr = dst_buf.ptr;
            let mut staging_ptr = staging.ptr;
            let mut raw_params: Vec<*mut c_void> = vec![
                &mut dst_ptr as *mut u64 as *mut c_void,
                &mut staging_ptr as *mut u64 as *mut c_void,
            ];
            cu.launch(&function, &mut raw_params)?;
            cu.synchronize()
        });
        struct CudaMerge {
            name: String,
            bindings: Bindings,
            ctx: Arc<dyn Context>,
            work: Work,
        }
        impl Routine for CudaMerge {
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
        Ok(Some(Arc::new(CudaMerge {
            name,
            bindings: Bindings::default(),
            ctx: dst.clone(),
            work: Work::new(device as Arc<dyn Device>, task),
        })))
    }
}

fn merge_kernel_source(name: &str, precision: Precision, size: usize, accum: Binop) -> KernelSource {
    let scalar = match precision {
        Precision::Byte => "unsigned char",
        Precision::Half => "__half",
        Precision::Single => "float",
        Precision::Double => "double",
    };
    let half_header = if precision == Precision::Half { "#include <cuda_fp16.h>\n" } else { "" };
    let load = |ptr: &str| match precision {
        Precision::Half => format!("(double)__half2float({ptr}[i])"),
        _ => format!("(double){ptr}[i]"),
    };
    let combined = match accum {
        Binop::Arg1 => load("dst"),
        Binop::Arg2 => load("src"),
        Binop::Add => format!("({} + {})", load("dst"), load("src")),
        Binop::Mul => format!("({} * {})", load("dst"), load("src")),
        Binop::ToPowOf => format!("pow({}, {})", load("dst"), load("src")),
        Binop::ReluGate => {
            format!("(({} > 0.0) ? {} : 0.0)", load("dst"), load("src"))
        }
    };
    let store = match precision {
        Precision::Byte => format!("dst[i] = (unsigned char)llrint({combined});"),
        Precision::Half => format!("dst[i] = __float2half((float)({combined}));"),
        Precision::Single => format!("dst[i] = (float)({combined});"),
        Precision::Double => format!("dst[i] = ({combined});"),
    };
    let kernel_name = format!(
        "k{}",
        name.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect::<String>()
    );
    let source = format!(
        "{half_header}extern \"C\" __global__ void {kernel_name}({scalar}* dst, {scalar}* src) {{\n  \
         for (long long i = 0; i < {size}; ++i) {store}\n}}\n"
    );
    KernelSource { name: kernel_name, source, params: vec![] }
}

/// Registers the backend under its name and returns it.
pub fn register() -> Arc<CudaBackend> {
    let backend = Arc::new(CudaBackend::new());
    dendrite_rs::register_backend(backend.clone());
    backend
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_kernel_source_accumulates() {
        let kernel = merge_kernel_source("merge_w", Precision::Single, 12, Binop::Add);
        assert!(kernel.source.contains("extern \"C\" __global__ void kmerge_w"));
        assert!(kernel.source.contains("i < 12"), "{}", kernel.source);
        assert!(kernel.source.contains("dst[i] = (float)"), "{}", kernel.source);
    }
}
