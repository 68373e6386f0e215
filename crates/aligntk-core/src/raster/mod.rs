//! The two raster types AlignTK operates on: 8-bit grayscale images and
//! 1-bit validity masks (§3). Both are row-major, origin top-left.

pub mod bitmap;
pub mod image;

pub use bitmap::Bitmap;
pub use image::GrayImage;
