//! Read-only file mappings backing `InitOp::FileMapped` buffers.

use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// A read-only memory mapping of a whole file.
///
/// The mapping is private and never written through; dropping unmaps it.
pub struct Mmap {
    base: *mut c_void,
    len: usize,
}

// The mapping is immutable for its whole lifetime.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Maps `path` read-only. Fails if the file is empty or unmappable.
    pub fn map_file(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("cannot map empty file {}", path.display()),
            ));
        }
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Mmap { base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.cast(), self.len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mmap({} bytes)", self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn maps_file_contents() {
        let mut path = std::env::temp_dir();
        path.push(format!("dendrite_mmap_test_{}.bin", std::process::id()));
        let payload: Vec<u8> = (0..64).collect();
        {
            let mut f = File::create(&path).expect("create temp file");
            f.write_all(&payload).expect("write payload");
        }
        let map = Mmap::map_file(&path).expect("map file");
        assert_eq!(map.as_slice(), &payload[..]);
        drop(map);
        std::fs::remove_file(&path).ok();
    }
}
