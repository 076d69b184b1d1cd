//! Dense row-major n-dimensional host buffers at the four supported precisions.

pub mod mmap;

use std::path::PathBuf;

use anyhow::{bail, ensure, Context, Result};
use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config;
use crate::precision::{float_to_byte, Precision};
use mmap::Mmap;

/// How a buffer is initialized on creation or reset.
#[derive(Debug, Clone)]
pub enum InitOp {
    /// Fill from the given values. With `strict` the length must equal the
    /// element count; otherwise values cycle modulo their length.
    ConstantFill { values: Vec<f64>, strict: bool },
    /// Every cell holds its own row-major linear offset.
    RangeOverOffsets,
    /// IID draws from U[0,1), seeded deterministically when
    /// `fixed_state_for_init` is set.
    StandardUniform,
    /// Map a raw little-endian dump of the declared precision.
    FileMapped { path: PathBuf, precision: Precision },
}

#[derive(Debug)]
enum Storage {
    Byte(Vec<u8>),
    Half(Vec<f16>),
    Single(Vec<f32>),
    Double(Vec<f64>),
    /// Raw bytes of a read-only file, interpreted at the buffer's precision.
    Mapped(Mmap),
}

/// A dense row-major multi-dimensional array tagged with its precision.
///
/// Size-zero buffers are legal ("void") and hold no storage.
#[derive(Debug)]
pub struct NdBuffer {
    precision: Precision,
    dims: Vec<usize>,
    data: Storage,
}

fn product(dims: &[usize]) -> usize {
    dims.iter().product()
}

impl NdBuffer {
    /// Creates a buffer of the given precision and dims, initialized by `init`.
    pub fn create(precision: Precision, dims: &[usize], init: &InitOp) -> Result<Self> {
        let mut buffer = NdBuffer {
            precision,
            dims: dims.to_vec(),
            data: Storage::empty(precision, product(dims)),
        };
        buffer.reset(init)?;
        Ok(buffer)
    }

    /// Re-initializes the buffer in place.
    pub fn reset(&mut self, init: &InitOp) -> Result<()> {
        let size = self.size();
        match init {
            InitOp::ConstantFill { values, strict } => {
                if *strict {
                    ensure!(
                        values.len() == size,
                        "strict constant fill of {} values into a buffer of {} cells (dims {:?})",
                        values.len(),
                        size,
                        self.dims
                    );
                } else {
                    ensure!(!values.is_empty() || size == 0, "constant fill with no values");
                }
                self.ensure_writable("constant fill")?;
                for offset in 0..size {
                    self.set_at_offset(offset, values[offset % values.len()])?;
                }
            }
            InitOp::RangeOverOffsets => {
                self.ensure_writable("range-over-offsets fill")?;
                for offset in 0..size {
                    self.set_at_offset(offset, offset as f64)?;
                }
            }
            InitOp::StandardUniform => {
                self.ensure_writable("uniform fill")?;
                let mut rng = match config::fixed_state_for_init() {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                for offset in 0..size {
                    let v: f64 = rng.gen();
                    self.set_at_offset(offset, v)?;
                }
            }
            InitOp::FileMapped { path, precision } => {
                ensure!(
                    *precision == self.precision,
                    "file {} holds {} data but the buffer is {}",
                    path.display(),
                    precision,
                    self.precision
                );
                let expected = size * self.precision.size_in_bytes();
                let actual = std::fs::metadata(path)
                    .with_context(|| format!("stat {}", path.display()))?
                    .len() as usize;
                ensure!(
                    actual == expected,
                    "file {} holds {actual} bytes but dims {:?} at {} require {expected}",
                    path.display(),
                    self.dims,
                    self.precision
                );
                let map = Mmap::map_file(path)
                    .with_context(|| format!("map {}", path.display()))?;
                self.data = Storage::Mapped(map);
            }
        }
        Ok(())
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        product(&self.dims)
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size() * self.precision.size_in_bytes()
    }

    /// Row-major linear offset of `idcs`, validated per axis.
    fn offset_of(&self, idcs: &[usize]) -> Result<usize> {
        ensure!(
            idcs.len() == self.dims.len(),
            "index rank {} does not match buffer rank {} (dims {:?})",
            idcs.len(),
            self.dims.len(),
            self.dims
        );
        let mut offset = 0usize;
        for (axis, (&i, &d)) in idcs.iter().zip(self.dims.iter()).enumerate() {
            ensure!(
                i < d,
                "index {i} out of bounds for axis {axis} of extent {d} (indices {idcs:?}, dims {:?})",
                self.dims
            );
            offset = offset * d + i;
        }
        Ok(offset)
    }

    /// Reads the cell at `idcs`, converted to float.
    pub fn get_as_float(&self, idcs: &[usize]) -> Result<f64> {
        let offset = self.offset_of(idcs)?;
        Ok(self.get_at_offset(offset))
    }

    /// Writes the cell at `idcs` from a float, converting per precision.
    pub fn set_from_float(&mut self, idcs: &[usize], v: f64) -> Result<()> {
        let offset = self.offset_of(idcs)?;
        self.set_at_offset(offset, v)
    }

    /// Overwrites every cell with `v`.
    pub fn fill_from_float(&mut self, v: f64) -> Result<()> {
        self.ensure_writable("fill")?;
        for offset in 0..self.size() {
            self.set_at_offset(offset, v)?;
        }
        Ok(())
    }

    /// Folds `f` over all cells in row-major order.
    pub fn fold<A>(&self, init: A, mut f: impl FnMut(A, f64) -> A) -> A {
        let mut acc = init;
        for offset in 0..self.size() {
            acc = f(acc, self.get_at_offset(offset));
        }
        acc
    }

    /// For each index tuple over all axes but the last, the value at `xdim`
    /// along the last axis. Intended for plotting.
    pub fn retrieve_1d_points(&self, xdim: usize) -> Result<Vec<f64>> {
        self.retrieve_points(&[xdim])
            .map(|points| points.into_iter().map(|p| p[0]).collect())
    }

    /// Like [`retrieve_1d_points`](Self::retrieve_1d_points), but pairs the
    /// values at `xdim` and `ydim` along the last axis.
    pub fn retrieve_2d_points(&self, xdim: usize, ydim: usize) -> Result<Vec<(f64, f64)>> {
        self.retrieve_points(&[xdim, ydim])
            .map(|points| points.into_iter().map(|p| (p[0], p[1])).collect())
    }

    fn retrieve_points(&self, picks: &[usize]) -> Result<Vec<Vec<f64>>> {
        ensure!(!self.dims.is_empty(), "cannot retrieve points from a rank-0 buffer");
        let last = *self.dims.last().unwrap();
        for &pick in picks {
            ensure!(
                pick < last,
                "axis pick {pick} out of bounds for final axis of extent {last}"
            );
        }
        let rows = product(&self.dims[..self.dims.len() - 1]);
        let mut points = Vec::with_capacity(rows);
        for row in 0..rows {
            let base = row * last;
            points.push(picks.iter().map(|&p| self.get_at_offset(base + p)).collect());
        }
        Ok(points)
    }

    fn ensure_writable(&mut self, what: &str) -> Result<()> {
        if let Storage::Mapped(_) = self.data {
            // Writing to a mapped buffer discards the mapping first.
            if self.size() == 0 {
                bail!("{what} into a mapped void buffer");
            }
            self.data = Storage::empty(self.precision, self.size());
        }
        Ok(())
    }

    fn get_at_offset(&self, offset: usize) -> f64 {
        match &self.data {
            Storage::Byte(v) => v[offset] as f64,
            Storage::Half(v) => v[offset].to_f64(),
            Storage::Single(v) => v[offset] as f64,
            Storage::Double(v) => v[offset],
            Storage::Mapped(map) => {
                let bytes = map.as_slice();
                let w = self.precision.size_in_bytes();
                let at = &bytes[offset * w..(offset + 1) * w];
                match self.precision {
                    Precision::Byte => at[0] as f64,
                    Precision::Half => f16::from_le_bytes([at[0], at[1]]).to_f64(),
                    Precision::Single => {
                        f32::from_le_bytes([at[0], at[1], at[2], at[3]]) as f64
                    }
                    Precision::Double => f64::from_le_bytes([
                        at[0], at[1], at[2], at[3], at[4], at[5], at[6], at[7],
                    ]),
                }
            }
        }
    }

    fn set_at_offset(&mut self, offset: usize, v: f64) -> Result<()> {
        match &mut self.data {
            Storage::Byte(dst) => dst[offset] = float_to_byte(v)?,
            Storage::Half(dst) => dst[offset] = f16::from_f64(v),
            Storage::Single(dst) => dst[offset] = v as f32,
            Storage::Double(dst) => dst[offset] = v,
            Storage::Mapped(_) => bail!("cannot write into a file-mapped buffer"),
        }
        Ok(())
    }

    /// Raw little-endian bytes of the whole buffer, for host-device transfer.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.data {
            Storage::Byte(v) => v.clone(),
            Storage::Half(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Storage::Single(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Storage::Double(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Storage::Mapped(map) => map.as_slice().to_vec(),
        }
    }

    /// Overwrites the buffer from raw little-endian bytes.
    pub fn copy_from_le_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        ensure!(
            bytes.len() == self.size_in_bytes(),
            "byte payload of {} does not match buffer of {} bytes",
            bytes.len(),
            self.size_in_bytes()
        );
        self.ensure_writable("byte copy")?;
        let w = self.precision.size_in_bytes();
        for offset in 0..self.size() {
            let at = &bytes[offset * w..(offset + 1) * w];
            let v = match self.precision {
                Precision::Byte => at[0] as f64,
                Precision::Half => f16::from_le_bytes([at[0], at[1]]).to_f64(),
                Precision::Single => f32::from_le_bytes([at[0], at[1], at[2], at[3]]) as f64,
                Precision::Double => {
                    f64::from_le_bytes([at[0], at[1], at[2], at[3], at[4], at[5], at[6], at[7]])
                }
            };
            self.set_at_offset(offset, v)?;
        }
        Ok(())
    }
}

impl Storage {
    fn empty(precision: Precision, size: usize) -> Storage {
        match precision {
            Precision::Byte => Storage::Byte(vec![0; size]),
            Precision::Half => Storage::Half(vec![f16::ZERO; size]),
            Precision::Single => Storage::Single(vec![0.0; size]),
            Precision::Double => Storage::Double(vec![0.0; size]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn strict_fill_requires_exact_length() {
        let err = NdBuffer::create(
            Precision::Single,
            &[2, 3],
            &InitOp::ConstantFill { values: vec![1.0; 5], strict: true },
        )
        .unwrap_err();
        assert!(err.to_string().contains("strict constant fill"), "{err}");
    }

    #[test]
    fn non_strict_fill_cycles() {
        let buf = NdBuffer::create(
            Precision::Double,
            &[5],
            &InitOp::ConstantFill { values: vec![1.0, 2.0], strict: false },
        )
        .unwrap();
        assert_eq!(buf.get_as_float(&[4]).unwrap(), 1.0);
        assert_eq!(buf.get_as_float(&[3]).unwrap(), 2.0);
    }

    #[test]
    fn range_over_offsets_is_row_major() {
        let buf = NdBuffer::create(Precision::Single, &[2, 3], &InitOp::RangeOverOffsets).unwrap();
        assert_eq!(buf.get_as_float(&[0, 0]).unwrap(), 0.0);
        assert_eq!(buf.get_as_float(&[0, 2]).unwrap(), 2.0);
        assert_eq!(buf.get_as_float(&[1, 0]).unwrap(), 3.0);
        assert_eq!(buf.get_as_float(&[1, 2]).unwrap(), 5.0);
    }

    #[test]
    fn byte_overflow_is_an_error() {
        let mut buf = NdBuffer::create(Precision::Byte, &[1], &InitOp::RangeOverOffsets).unwrap();
        assert!(buf.set_from_float(&[0], 300.0).is_err());
        buf.set_from_float(&[0], 41.5).unwrap();
        assert_eq!(buf.get_as_float(&[0]).unwrap(), 42.0);
    }

    #[test]
    fn out_of_bounds_names_the_indices() {
        let buf = NdBuffer::create(Precision::Single, &[2, 3], &InitOp::RangeOverOffsets).unwrap();
        let err = buf.get_as_float(&[1, 3]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("out of bounds"), "{msg}");
        assert!(msg.contains("[1, 3]"), "{msg}");
    }

    #[test]
    fn void_buffers_are_legal() {
        let buf = NdBuffer::create(Precision::Double, &[0, 4], &InitOp::RangeOverOffsets).unwrap();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.size_in_bytes(), 0);
        assert_eq!(buf.fold(0u32, |n, _| n + 1), 0);
    }

    #[test]
    fn file_mapped_checks_length_and_precision() {
        let mut path = std::env::temp_dir();
        path.push(format!("dendrite_buffer_map_{}.raw", std::process::id()));
        let values: Vec<f32> = (0..6).map(|i| i as f32 * 1.5).collect();
        {
            let mut f = std::fs::File::create(&path).expect("create dump");
            for v in &values {
                f.write_all(&v.to_le_bytes()).expect("write dump");
            }
        }
        let init = InitOp::FileMapped { path: path.clone(), precision: Precision::Single };
        // Wrong dims: length check fires before mapping.
        assert!(NdBuffer::create(Precision::Single, &[7], &init).is_err());
        // Wrong precision.
        assert!(NdBuffer::create(Precision::Double, &[6], &init).is_err());
        let buf = NdBuffer::create(Precision::Single, &[2, 3], &init).unwrap();
        assert_eq!(buf.get_as_float(&[1, 1]).unwrap(), 6.0);
        drop(buf);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn point_retrieval_picks_along_last_axis() {
        let buf = NdBuffer::create(Precision::Double, &[3, 2], &InitOp::RangeOverOffsets).unwrap();
        let xs = buf.retrieve_1d_points(1).unwrap();
        assert_eq!(xs, vec![1.0, 3.0, 5.0]);
        let pairs = buf.retrieve_2d_points(0, 1).unwrap();
        assert_eq!(pairs, vec![(0.0, 1.0), (2.0, 3.0), (4.0, 5.0)]);
    }
}
