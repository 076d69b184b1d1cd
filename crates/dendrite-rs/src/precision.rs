//! Enumerates the scalar precisions supported by buffers and backends.

use anyhow::{bail, Result};

/// Logical element precision shared between host buffers and device copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    /// Unsigned 8-bit integer, converted to and from float on access.
    Byte,
    /// 16-bit floating point (fp16).
    Half,
    /// 32-bit floating point following IEEE-754 semantics.
    Single,
    /// 64-bit floating point.
    Double,
}

impl Precision {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            Precision::Byte => 1,
            Precision::Half => 2,
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }

    /// Short lowercase name used in diagnostics and generated code.
    pub fn name(self) -> &'static str {
        match self {
            Precision::Byte => "byte",
            Precision::Half => "half",
            Precision::Single => "single",
            Precision::Double => "double",
        }
    }

    /// C scalar type used by kernel code generators.
    pub fn c_type(self) -> &'static str {
        match self {
            Precision::Byte => "unsigned char",
            Precision::Half => "__half",
            Precision::Single => "float",
            Precision::Double => "double",
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Converts a float to the byte precision with rounding.
///
/// Values outside `[0, 255]` after rounding are a caller bug and fail with a
/// descriptive error instead of being truncated.
pub fn float_to_byte(v: f64) -> Result<u8> {
    let rounded = v.round();
    if !(0.0..=255.0).contains(&rounded) || rounded.is_nan() {
        bail!("value {v} does not fit byte precision after rounding to {rounded}");
    }
    Ok(rounded as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_match_storage() {
        assert_eq!(Precision::Byte.size_in_bytes(), 1);
        assert_eq!(Precision::Half.size_in_bytes(), 2);
        assert_eq!(Precision::Single.size_in_bytes(), 4);
        assert_eq!(Precision::Double.size_in_bytes(), 8);
    }

    #[test]
    fn byte_conversion_rounds_and_checks() {
        assert_eq!(float_to_byte(41.6).unwrap(), 42);
        assert_eq!(float_to_byte(0.0).unwrap(), 0);
        assert_eq!(float_to_byte(255.4).unwrap(), 255);
        assert!(float_to_byte(-1.0).is_err());
        assert!(float_to_byte(256.0).is_err());
        assert!(float_to_byte(f64::NAN).is_err());
    }
}
