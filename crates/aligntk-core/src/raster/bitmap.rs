//! 1-bit-per-pixel validity mask (§3 "Mask (bitmap)", §6 "Bitmap file
//! format"). MSB-first within each byte, row stride `(width+7)/8`. A set
//! bit marks a valid pixel; cleared bits are excluded from all
//! correlation, residual, and relaxation computations.

use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{AlignError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    pub width: usize,
    pub height: usize,
    /// Row-major, `row_stride()` bytes per row, MSB-first.
    pub bytes: Vec<u8>,
}

impl Bitmap {
    pub fn row_stride(width: usize) -> usize {
        (width + 7) / 8
    }

    /// All bits set (every pixel valid).
    pub fn all_valid(width: usize, height: usize) -> Self {
        let stride = Self::row_stride(width);
        Self {
            width,
            height,
            bytes: vec![0xFFu8; stride * height],
        }
    }

    /// All bits cleared (every pixel invalid) — used to construct the
    /// "fully masked out" boundary case of §8 scenario 5.
    pub fn all_invalid(width: usize, height: usize) -> Self {
        let stride = Self::row_stride(width);
        Self {
            width,
            height,
            bytes: vec![0u8; stride * height],
        }
    }

    pub fn from_bytes(width: usize, height: usize, bytes: Vec<u8>) -> Result<Self> {
        let expected = Self::row_stride(width) * height;
        if bytes.len() != expected {
            return Err(AlignError::FormatError(format!(
                "bitmap byte length {} does not match {}x{} (expected {})",
                bytes.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            bytes,
        })
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> bool {
        let stride = Self::row_stride(self.width);
        let byte = self.bytes[y * stride + x / 8];
        (byte >> (7 - (x % 8))) & 1 != 0
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, valid: bool) {
        let stride = Self::row_stride(self.width);
        let idx = y * stride + x / 8;
        let bit = 7 - (x % 8);
        if valid {
            self.bytes[idx] |= 1 << bit;
        } else {
            self.bytes[idx] &= !(1 << bit);
        }
    }

    /// Count of set (valid) bits, clipped to `width` per row (trailing
    /// padding bits in the last byte of a row are never counted).
    pub fn count_valid(&self) -> usize {
        let mut n = 0;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    n += 1;
                }
            }
        }
        n
    }

    pub fn is_empty_mask(&self) -> bool {
        self.count_valid() == 0
    }

    /// Read a binary PBM (`P4`), transparently gzip-decompressing first
    /// when the path ends in `.gz`.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AlignError::InputMissing(path.display().to_string()));
        }
        let raw = std::fs::read(path)?;
        let decompressed;
        let data: &[u8] = if path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("gz"))
            .unwrap_or(false)
        {
            let mut out = Vec::new();
            GzDecoder::new(&raw[..]).read_to_end(&mut out)?;
            decompressed = out;
            &decompressed
        } else {
            &raw
        };
        Self::parse_pbm(data)
    }

    fn parse_pbm(data: &[u8]) -> Result<Self> {
        if data.len() < 2 || &data[0..2] != b"P4" {
            return Err(AlignError::FormatError("not a P4 PBM bitmap".into()));
        }
        let mut pos = 2usize;
        let mut fields = Vec::with_capacity(2);
        while fields.len() < 2 {
            // Skip whitespace and `#`-comments between header tokens.
            while pos < data.len() && (data[pos] as char).is_whitespace() {
                pos += 1;
            }
            if pos < data.len() && data[pos] == b'#' {
                while pos < data.len() && data[pos] != b'\n' {
                    pos += 1;
                }
                continue;
            }
            let start = pos;
            while pos < data.len() && !(data[pos] as char).is_whitespace() {
                pos += 1;
            }
            if start == pos {
                return Err(AlignError::FormatError("truncated PBM header".into()));
            }
            let tok = std::str::from_utf8(&data[start..pos])
                .map_err(|_| AlignError::FormatError("non-ASCII PBM header token".into()))?;
            let val: usize = tok
                .parse()
                .map_err(|_| AlignError::FormatError(format!("invalid PBM header token {tok}")))?;
            fields.push(val);
        }
        // Exactly one whitespace byte separates the header from the body.
        pos += 1;
        let width = fields[0];
        let height = fields[1];
        let stride = Self::row_stride(width);
        let expected = stride * height;
        if data.len() < pos + expected {
            return Err(AlignError::FormatError(format!(
                "truncated PBM body: need {expected} bytes, have {}",
                data.len() - pos
            )));
        }
        Self::from_bytes(width, height, data[pos..pos + expected].to_vec())
    }

    /// Write a binary PBM (`P4`), gzip-compressing when the path ends in
    /// `.gz`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut body = Vec::with_capacity(16 + self.bytes.len());
        body.extend_from_slice(format!("P4\n{} {}\n", self.width, self.height).as_bytes());
        body.extend_from_slice(&self.bytes);

        if path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("gz"))
            .unwrap_or(false)
        {
            let f = std::fs::File::create(path)?;
            let mut enc = GzEncoder::new(f, Compression::default());
            enc.write_all(&body)?;
            enc.finish()?;
        } else {
            std::fs::write(path, &body)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_plain() {
        let mut bm = Bitmap::all_invalid(13, 5);
        bm.set(0, 0, true);
        bm.set(12, 4, true);
        bm.set(7, 2, true);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.pbm");
        bm.write(&path).unwrap();
        let read_back = Bitmap::read(&path).unwrap();
        assert_eq!(bm, read_back);
    }

    #[test]
    fn round_trip_gz() {
        let mut bm = Bitmap::all_valid(33, 17);
        bm.set(5, 5, false);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.pbm.gz");
        bm.write(&path).unwrap();
        let read_back = Bitmap::read(&path).unwrap();
        assert_eq!(bm, read_back);
    }

    #[test]
    fn empty_mask_detected() {
        let bm = Bitmap::all_invalid(8, 8);
        assert!(bm.is_empty_mask());
        let mut bm2 = bm.clone();
        bm2.set(0, 0, true);
        assert!(!bm2.is_empty_mask());
    }

    #[test]
    fn bit_order_msb_first() {
        let mut bm = Bitmap::all_invalid(8, 1);
        bm.set(0, 0, true);
        assert_eq!(bm.bytes[0], 0b1000_0000);
        bm.set(7, 0, true);
        assert_eq!(bm.bytes[0], 0b1000_0001);
    }
}
