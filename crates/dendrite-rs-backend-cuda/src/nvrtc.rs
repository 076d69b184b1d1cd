//! Dynamically loaded NVRTC bindings: CUDA C to PTX.

use std::ffi::{c_void, CString};
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, bail, Result};
use libloading::Library;

type NvrtcResult = i32;
type NvrtcProgram = *mut c_void;

const NVRTC_SUCCESS: NvrtcResult = 0;

type CreateProgramFn = unsafe extern "C" fn(
    prog: *mut NvrtcProgram,
    src: *const i8,
    name: *const i8,
    num_headers: i32,
    headers: *const *const i8,
    include_names: *const *const i8,
) -> NvrtcResult;
type CompileProgramFn =
    unsafe extern "C" fn(prog: NvrtcProgram, num_options: i32, options: *const *const i8) -> NvrtcResult;
type GetPtxSizeFn = unsafe extern "C" fn(prog: NvrtcProgram, size: *mut usize) -> NvrtcResult;
type GetPtxFn = unsafe extern "C" fn(prog: NvrtcProgram, ptx: *mut i8) -> NvrtcResult;
type GetLogSizeFn = unsafe extern "C" fn(prog: NvrtcProgram, size: *mut usize) -> NvrtcResult;
type GetLogFn = unsafe extern "C" fn(prog: NvrtcProgram, log: *mut i8) -> NvrtcResult;
type DestroyProgramFn = unsafe extern "C" fn(prog: *mut NvrtcProgram) -> NvrtcResult;

struct NvrtcFns {
    create: CreateProgramFn,
    compile: CompileProgramFn,
    ptx_size: GetPtxSizeFn,
    ptx: GetPtxFn,
    log_size: GetLogSizeFn,
    log: GetLogFn,
    destroy: DestroyProgramFn,
}

pub struct Nvrtc {
    _library: Library,
    fns: NvrtcFns,
}

unsafe impl Send for Nvrtc {}
unsafe impl Sync for Nvrtc {}

static NVRTC: OnceLock<std::result::Result<Arc<Nvrtc>, String>> = OnceLock::new();

pub fn nvrtc() -> Result<Arc<Nvrtc>> {
    let entry = NVRTC.get_or_init(|| {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        let library = unsafe {
            Library::new("libnvrtc.so")
                .or_else(|_| Library::new("libnvrtc.so.12"))
                .or_else(|_| Library::new("libnvrtc.so.11.2"))
                .map_err(|e| format!("loading libnvrtc: {e}"))?
        };
        macro_rules! resolve {
            ($name:literal) => {
                // SAFETY: Caller provides expected symbol type from the NVRTC API.
                *unsafe {
                    library.get($name).map_err(|e| {
                        format!("resolving {}: {e}", String::from_utf8_lossy($name))
                    })?
                }
            };
        }
        let fns = NvrtcFns {
            create: resolve!(b"nvrtcCreateProgram\0"),
            compile: resolve!(b"nvrtcCompileProgram\0"),
            ptx_size: resolve!(b"nvrtcGetPTXSize\0"),
            ptx: resolve!(b"nvrtcGetPTX\0"),
            log_size: resolve!(b"nvrtcGetProgramLogSize\0"),
            log: resolve!(b"nvrtcGetProgramLog\0"),
            destroy: resolve!(b"nvrtcDestroyProgram\0"),
        };
        Ok(Arc::new(Nvrtc { _library: library, fns }))
    });
    entry.clone().map_err(|e| anyhow!("{e}"))
}

/// The outcome of an NVRTC compilation: PTX plus the build log.
pub struct CompiledPtx {
    pub ptx: String,
    pub log: String,
}

impl Nvrtc {
    /// Compiles CUDA C source into PTX, returning the compiler log either way.
    pub fn compile(&self, name: &str, source: &str) -> Result<CompiledPtx> {
        let c_source = CString::new(source)?;
        let c_name = CString::new(format!("{name}.cu"))?;
        let mut prog: NvrtcProgram = std::ptr::null_mut();
        // SAFETY: `prog` is a valid out pointer; source and name are NUL-terminated and
        // outlive the call; no headers are passed.
        let created = unsafe {
            (self.fns.create)(
                &mut prog,
                c_source.as_ptr(),
                c_name.as_ptr(),
                0,
                std::ptr::null(),
                std::ptr::null(),
            )
        };
        if created != NVRTC_SUCCESS {
            bail!("nvrtcCreateProgram failed with error {created}");
        }
        // SAFETY: `prog` was created above and no options are passed.
        let status = unsafe { (self.fns.compile)(prog, 0, std::ptr::null()) };
        let log = self.read_log(prog);
        if status != NVRTC_SUCCESS {
            // SAFETY: `prog` is live and destroyed exactly once on this error path.
            unsafe {
                (self.fns.destroy)(&mut prog);
            }
            bail!("nvrtc compilation of \"{name}\" failed:\n{log}");
        }
        let mut size = 0usize;
        // SAFETY: `prog` is live; `size` is a valid out pointer and the PTX buffer is
        // allocated to the size NVRTC reported.
        let ptx = unsafe {
            if (self.fns.ptx_size)(prog, &mut size) != NVRTC_SUCCESS {
                (self.fns.destroy)(&mut prog);
                bail!("nvrtcGetPTXSize failed for \"{name}\"");
            }
            let mut buf = vec![0u8; size];
            if (self.fns.ptx)(prog, buf.as_mut_ptr().cast()) != NVRTC_SUCCESS {
                (self.fns.destroy)(&mut prog);
                bail!("nvrtcGetPTX failed for \"{name}\"");
            }
            buf.pop();
            String::from_utf8_lossy(&buf).into_owned()
        };
        // SAFETY: `prog` is live and destroyed exactly once on the success path.
        unsafe {
            (self.fns.destroy)(&mut prog);
        }
        Ok(CompiledPtx { ptx, log })
    }

    fn read_log(&self, prog: NvrtcProgram) -> String {
        let mut size = 0usize;
        // SAFETY: `prog` is live for the whole call; the log buffer is allocated to the
        // size NVRTC reported.
        unsafe {
            if (self.fns.log_size)(prog, &mut size) != NVRTC_SUCCESS || size <= 1 {
                return String::new();
            }
            let mut buf = vec![0u8; size];
            if (self.fns.log)(prog, buf.as_mut_ptr().cast()) != NVRTC_SUCCESS {
                return String::new();
            }
            buf.pop();
            String::from_utf8_lossy(&buf).into_owned()
        }
    }
}
