//! 8-bit grayscale raster (§3 "Image").
//!
//! Decoding/encoding of the many on-disk image formats listed in §6
//! (TIFF/PGM/PPM/JPEG/BMP) is an out-of-scope external collaborator; this
//! module leans on the `image` crate for that job and only ever hands
//! the rest of AlignTK a decoded 8-bpp buffer.

use std::path::Path;

use crate::error::{AlignError, Result};

/// A rectangular 8-bit grayscale raster, row-major, origin top-left.
/// Pixel value `0` is a sentinel for "masked" in some contexts; whether a
/// pixel counts as valid is authoritative in the companion [`Bitmap`],
/// not in the pixel value itself.
///
/// [`Bitmap`]: crate::raster::Bitmap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0u8; width * height],
        }
    }

    pub fn from_pixels(width: usize, height: usize, pixels: Vec<u8>) -> Result<Self> {
        if pixels.len() != width * height {
            return Err(AlignError::FormatError(format!(
                "pixel buffer length {} does not match {}x{}",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: u8) {
        self.pixels[y * self.width + x] = v;
    }

    /// Decode any image file the `image` crate supports into an 8-bpp
    /// grayscale raster. Extension matching is delegated to `image`'s own
    /// format sniffing, which is extension-case-insensitive and falls
    /// back to content sniffing, matching §6's "extension matching is
    /// case-insensitive" contract for this external collaborator.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AlignError::InputMissing(path.display().to_string()));
        }
        let img = image::open(path)?;
        let gray = img.to_luma8();
        let (w, h) = gray.dimensions();
        Ok(Self {
            width: w as usize,
            height: h as usize,
            pixels: gray.into_raw(),
        })
    }

    /// Write as 8-bit PGM (P5) or, for any other extension, delegate to
    /// `image`'s format dispatch on the same decoded buffer.
    pub fn write(&self, path: &Path) -> Result<()> {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase) {
            Some(ext) if ext == "pgm" => self.write_pgm(path),
            _ => {
                let buf = image::GrayImage::from_raw(
                    self.width as u32,
                    self.height as u32,
                    self.pixels.clone(),
                )
                .ok_or_else(|| {
                    AlignError::FormatError("pixel buffer size mismatch on encode".into())
                })?;
                buf.save(path)?;
                Ok(())
            }
        }
    }

    fn write_pgm(&self, path: &Path) -> Result<()> {
        use std::io::Write;
        let mut f = std::fs::File::create(path)?;
        write!(f, "P5\n{} {}\n255\n", self.width, self.height)?;
        f.write_all(&self.pixels)?;
        Ok(())
    }
}
