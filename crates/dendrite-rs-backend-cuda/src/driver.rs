//! Dynamically loaded CUDA driver API bindings.
//!
//! The driver library is resolved at runtime through `libloading`, so the
//! crate builds and its code generator is testable on machines without CUDA.

use std::ffi::{c_void, CString};
use std::fmt;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, bail, Result};
use libloading::Library;

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;
type CUmodule = *mut c_void;
type CUfunction = *mut c_void;
type CUstream = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(count: *mut i32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuCtxCreateFn = unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSynchronizeFn = unsafe extern "C" fn() -> CUresult;
type CuMemAllocFn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeFn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDFn =
    unsafe extern "C" fn(dst: CUdeviceptr, src: *const c_void, bytes: usize) -> CUresult;
type CuMemcpyDtoHFn =
    unsafe extern "C" fn(dst: *mut c_void, src: CUdeviceptr, bytes: usize) -> CUresult;
type CuMemsetD8Fn = unsafe extern "C" fn(dst: CUdeviceptr, value: u8, count: usize) -> CUresult;
type CuModuleLoadDataExFn = unsafe extern "C" fn(
    module: *mut CUmodule,
    image: *const c_void,
    num_options: u32,
    options: *mut u32,
    option_values: *mut *mut c_void,
) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const i8) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_x: u32,
    grid_y: u32,
    grid_z: u32,
    block_x: u32,
    block_y: u32,
    block_z: u32,
    shared_mem: u32,
    stream: CUstream,
    params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get_count: CuDeviceGetCountFn,
    cu_device_get: CuDeviceGetFn,
    cu_ctx_create: CuCtxCreateFn,
    cu_ctx_destroy: CuCtxDestroyFn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_ctx_synchronize: CuCtxSynchronizeFn,
    cu_mem_alloc: CuMemAllocFn,
    cu_mem_free: CuMemFreeFn,
    cu_memcpy_htod: CuMemcpyHtoDFn,
    cu_memcpy_dtoh: CuMemcpyDtoHFn,
    cu_memset_d8: CuMemsetD8Fn,
    cu_module_load_data_ex: CuModuleLoadDataExFn,
    cu_module_unload: CuModuleUnloadFn,
    cu_module_get_function: CuModuleGetFunctionFn,
    cu_launch_kernel: CuLaunchKernelFn,
}

/// The loaded driver library plus its resolved entry points.
pub struct CudaDriver {
    _library: Library,
    fns: DriverFns,
}

unsafe impl Send for CudaDriver {}
unsafe impl Sync for CudaDriver {}

fn check(op: &str, result: CUresult) -> Result<()> {
    if result == CUDA_SUCCESS {
        Ok(())
    } else {
        bail!("{op} failed with CUDA error {result}")
    }
}

static DRIVER: OnceLock<std::result::Result<Arc<CudaDriver>, String>> = OnceLock::new();

/// Loads `libcuda` once per process and initializes the driver.
pub fn driver() -> Result<Arc<CudaDriver>> {
    let entry = DRIVER.get_or_init(|| {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        let library = unsafe {
            Library::new("libcuda.so")
                .or_else(|_| Library::new("libcuda.so.1"))
                .map_err(|e| format!("loading libcuda: {e}"))?
        };
        macro_rules! resolve {
            ($name:literal) => {
                // SAFETY: Caller provides expected symbol type from CUDA driver API.
                *unsafe {
                    library.get($name).map_err(|e| {
                        format!("resolving {}: {e}", String::from_utf8_lossy($name))
                    })?
                }
            };
        }
        let fns = DriverFns {
            cu_init: resolve!(b"cuInit\0"),
            cu_device_get_count: resolve!(b"cuDeviceGetCount\0"),
            cu_device_get: resolve!(b"cuDeviceGet\0"),
            cu_ctx_create: resolve!(b"cuCtxCreate_v2\0"),
            cu_ctx_destroy: resolve!(b"cuCtxDestroy_v2\0"),
            cu_ctx_set_current: resolve!(b"cuCtxSetCurrent\0"),
            cu_ctx_synchronize: resolve!(b"cuCtxSynchronize\0"),
            cu_mem_alloc: resolve!(b"cuMemAlloc_v2\0"),
            cu_mem_free: resolve!(b"cuMemFree_v2\0"),
            cu_memcpy_htod: resolve!(b"cuMemcpyHtoD_v2\0"),
            cu_memcpy_dtoh: resolve!(b"cuMemcpyDtoH_v2\0"),
            cu_memset_d8: resolve!(b"cuMemsetD8_v2\0"),
            cu_module_load_data_ex: resolve!(b"cuModuleLoadDataEx\0"),
            cu_module_unload: resolve!(b"cuModuleUnload\0"),
            cu_module_get_function: resolve!(b"cuModuleGetFunction\0"),
            cu_launch_kernel: resolve!(b"cuLaunchKernel\0"),
        };
        let driver = CudaDriver { _library: library, fns };
        // SAFETY: cuInit takes no pointers; the symbol was resolved from the loaded library.
        unsafe {
            if (driver.fns.cu_init)(0) != CUDA_SUCCESS {
                return Err("cuInit failed".to_string());
            }
        }
        Ok(Arc::new(driver))
    });
    entry.clone().map_err(|e| anyhow!("{e}"))
}

impl CudaDriver {
    pub fn device_count(&self) -> Result<usize> {
        let mut count = 0i32;
        // SAFETY: `count` is a valid out pointer for the duration of the call.
        check("cuDeviceGetCount", unsafe { (self.fns.cu_device_get_count)(&mut count) })?;
        Ok(count.max(0) as usize)
    }

    pub fn create_context(&self, ordinal: usize) -> Result<OwnedContext> {
        let mut device: CUdevice = 0;
        // SAFETY: `device` is a valid out pointer; the ordinal is range-checked by the driver.
        check("cuDeviceGet", unsafe { (self.fns.cu_device_get)(&mut device, ordinal as i32) })?;
        let mut ctx: CUcontext = std::ptr::null_mut();
        // SAFETY: `ctx` is a valid out pointer and `device` was just produced by cuDeviceGet.
        check("cuCtxCreate", unsafe { (self.fns.cu_ctx_create)(&mut ctx, 0, device) })?;
        Ok(OwnedContext { raw: ctx })
    }

    pub fn set_current(&self, ctx: &OwnedContext) -> Result<()> {
        // SAFETY: The handle was created by this driver and stays valid until its owner drops.
        check("cuCtxSetCurrent", unsafe { (self.fns.cu_ctx_set_current)(ctx.raw) })
    }

    pub fn synchronize(&self) -> Result<()> {
        // SAFETY: Takes no pointers; operates on the calling thread's current context.
        check("cuCtxSynchronize", unsafe { (self.fns.cu_ctx_synchronize)() })
    }

    pub fn alloc(&self, bytes: usize) -> Result<DeviceBuffer> {
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer for CUDA allocation.
        check("cuMemAlloc", unsafe { (self.fns.cu_mem_alloc)(&mut ptr, bytes.max(1)) })?;
        Ok(DeviceBuffer { ptr, bytes })
    }

    pub fn free(&self, buffer: &DeviceBuffer) {
        // SAFETY: The pointer was allocated by this driver and is released once by its owner.
        unsafe {
            (self.fns.cu_mem_free)(buffer.ptr);
        }
    }

    pub fn copy_to_device(&self, dst: &DeviceBuffer, bytes: &[u8]) -> Result<()> {
        // SAFETY: Destination is a valid allocated device pointer and the source host slice
        // is valid for `bytes.len()`.
        check("cuMemcpyHtoD", unsafe {
            (self.fns.cu_memcpy_htod)(dst.ptr, bytes.as_ptr().cast(), bytes.len())
        })
    }

    pub fn copy_to_host(&self, src: &DeviceBuffer, bytes: &mut [u8]) -> Result<()> {
        // SAFETY: Source device pointer is valid for `bytes.len()`; the destination host
        // buffer is valid and writable.
        check("cuMemcpyDtoH", unsafe {
            (self.fns.cu_memcpy_dtoh)(bytes.as_mut_ptr().cast(), src.ptr, bytes.len())
        })
    }

    pub fn memset_zero(&self, dst: &DeviceBuffer) -> Result<()> {
        // SAFETY: Destination is a valid allocated device pointer; the memset count is
        // bounded by the allocation size.
        check("cuMemsetD8", unsafe { (self.fns.cu_memset_d8)(dst.ptr, 0, dst.bytes) })
    }

    pub fn load_module(&self, ptx: &str) -> Result<OwnedModule> {
        let image = CString::new(ptx)?;
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: The image is a NUL-terminated PTX string and `module` is a valid out
        // pointer; no load options are passed.
        check("cuModuleLoadDataEx", unsafe {
            (self.fns.cu_module_load_data_ex)(
                &mut module,
                image.as_ptr().cast(),
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        })?;
        Ok(OwnedModule { raw: module })
    }

    pub fn unload_module(&self, module: &OwnedModule) {
        // SAFETY: Module belongs to this driver and is unloaded once by its owning context.
        unsafe {
            (self.fns.cu_module_unload)(module.raw);
        }
    }

    pub fn get_function(&self, module: &OwnedModule, name: &str) -> Result<KernelFunction> {
        let symbol = CString::new(name)?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: Module and output pointers are valid; the symbol name is NUL-terminated.
        check("cuModuleGetFunction", unsafe {
            (self.fns.cu_module_get_function)(&mut function, module.raw, symbol.as_ptr())
        })?;
        Ok(KernelFunction { raw: function })
    }

    /// Launches single-block, single-thread: the generated kernels execute
    /// their whole loop nest sequentially on one lane.
    pub fn launch(&self, function: &KernelFunction, params: &mut [*mut c_void]) -> Result<()> {
        // SAFETY: Function and parameter pointers are valid for the kernel launch; the
        // caller keeps the parameter storage alive until the call returns.
        check("cuLaunchKernel", unsafe {
            (self.fns.cu_launch_kernel)(
                function.raw,
                1,
                1,
                1,
                1,
                1,
                1,
                0,
                std::ptr::null_mut(),
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        })
    }

    pub fn destroy_context(&self, ctx: &OwnedContext) {
        // SAFETY: Context was created by this driver and is destroyed once on drop.
        unsafe {
            (self.fns.cu_ctx_destroy)(ctx.raw);
        }
    }
}

/// A raw driver context handle owned by one backend context.
pub struct OwnedContext {
    raw: CUcontext,
}

unsafe impl Send for OwnedContext {}
unsafe impl Sync for OwnedContext {}

/// A raw loaded module handle.
pub struct OwnedModule {
    raw: CUmodule,
}

unsafe impl Send for OwnedModule {}
unsafe impl Sync for OwnedModule {}

/// A resolved kernel entry point.
pub struct KernelFunction {
    raw: CUfunction,
}

unsafe impl Send for KernelFunction {}
unsafe impl Sync for KernelFunction {}

/// A device allocation; freed by the owning context.
#[derive(Clone, Copy)]
pub struct DeviceBuffer {
    pub ptr: CUdeviceptr,
    pub bytes: usize,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceBuffer(0x{:x}, {} bytes)", self.ptr, self.bytes)
    }
}
