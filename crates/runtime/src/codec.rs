//! Byte codecs for primitive values
//!
//! The stack-resident variable scheme and the bytes↔string boundary
//! conversions move primitives through byte vectors. Encodings are
//! little-endian and fixed-width so a buffer of N elements is exactly
//! N * size_of::<T>() bytes, which is what the compute-kernel slice
//! views require.

pub fn i64_to_bytes(v: i64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn bytes_to_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    i64::from_le_bytes(buf)
}

pub fn f64_to_bytes(v: f64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn bytes_to_f64(bytes: &[u8]) -> f64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    f64::from_le_bytes(buf)
}

pub fn bool_to_bytes(v: bool) -> Vec<u8> {
    vec![u8::from(v)]
}

pub fn bytes_to_bool(bytes: &[u8]) -> bool {
    bytes.first().is_some_and(|b| *b != 0)
}

/// Pack a slice of floats into one contiguous little-endian buffer
/// (the layout `StackGuard::slice_raw` views in place).
pub fn f64s_to_bytes(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Pack a slice of ints into one contiguous little-endian buffer.
pub fn i64s_to_bytes(values: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_roundtrip() {
        for v in [0, 1, -1, i64::MAX, i64::MIN] {
            assert_eq!(bytes_to_i64(&i64_to_bytes(v)), v);
        }
    }

    #[test]
    fn test_f64_roundtrip() {
        for v in [0.0, 19.6, -2.5, f64::MAX] {
            assert_eq!(bytes_to_f64(&f64_to_bytes(v)), v);
        }
    }

    #[test]
    fn test_bool_roundtrip() {
        assert!(bytes_to_bool(&bool_to_bytes(true)));
        assert!(!bytes_to_bool(&bool_to_bytes(false)));
    }

    #[test]
    fn test_short_buffer_tolerated() {
        assert_eq!(bytes_to_i64(&[7]), 7);
        assert!(!bytes_to_bool(&[]));
    }

    #[test]
    fn test_packed_floats_layout() {
        let bytes = f64s_to_bytes(&[1.0, 2.0]);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes_to_f64(&bytes[8..]), 2.0);
    }
}
