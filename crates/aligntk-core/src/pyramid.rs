//! Component A: image pyramid & mask store (§4.A).
//!
//! Exposes [`PyramidStore::get_level`], which builds missing levels
//! lazily by mask-aware 2x2 box reduction, caches results in memory with
//! an LRU bounded by a configured byte budget, and persists built levels
//! to disk (atomic rename) so concurrent workers (component F) can share
//! them without coordination.

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::error::{AlignError, Result};
use crate::raster::{Bitmap, GrayImage};

/// One level of a pyramid: an image and its co-sized validity mask.
#[derive(Clone, Debug)]
pub struct PyramidLevel {
    pub image: GrayImage,
    pub mask: Bitmap,
}

impl PyramidLevel {
    fn approx_bytes(&self) -> usize {
        self.image.pixels.len() + self.mask.bytes.len()
    }
}

/// Down-sample one level by a mask-aware 2x2 box filter.
///
/// Each output pixel is the mean of its up to four valid contributors
/// (divisor = count of valid contributors); each output mask bit is the
/// OR of its contributors. Partial 1x2 / 2x1 blocks at odd edges are
/// averaged over whichever of the (up to four) source pixels exist.
/// Level k has dimensions `ceil(W/2^k) x ceil(H/2^k)` (§3).
pub fn downsample_2x(image: &GrayImage, mask: &Bitmap) -> (GrayImage, Bitmap) {
    let (w, h) = (image.width, image.height);
    let ow = (w + 1) / 2;
    let oh = (h + 1) / 2;

    let mut out_image = GrayImage::new(ow, oh);
    let mut out_mask = Bitmap::all_invalid(ow, oh);

    for oy in 0..oh {
        for ox in 0..ow {
            let x0 = ox * 2;
            let y0 = oy * 2;
            let mut sum: u32 = 0;
            let mut count: u32 = 0;
            let mut valid = false;
            for dy in 0..2 {
                let y = y0 + dy;
                if y >= h {
                    continue;
                }
                for dx in 0..2 {
                    let x = x0 + dx;
                    if x >= w {
                        continue;
                    }
                    if mask.get(x, y) {
                        sum += image.get(x, y) as u32;
                        count += 1;
                        valid = true;
                    }
                }
            }
            if count > 0 {
                out_image.set(ox, oy, (sum / count) as u8);
            }
            out_mask.set(ox, oy, valid);
        }
    }

    (out_image, out_mask)
}

/// Build a full pyramid from level 0 up to `max_level` inclusive, or
/// until either dimension reaches 1, whichever comes first (boundary
/// behavior: 1-pixel-wide/tall images must not crash and pyramid
/// construction simply stops). Pyramids are immutable once built.
pub fn build_pyramid(image0: GrayImage, mask0: Bitmap, max_level: usize) -> Vec<PyramidLevel> {
    let mut levels = Vec::with_capacity(max_level + 1);
    levels.push(PyramidLevel {
        image: image0,
        mask: mask0,
    });
    for _ in 0..max_level {
        let prev = levels.last().unwrap();
        if prev.image.width == 1 || prev.image.height == 1 {
            break;
        }
        let (img, msk) = downsample_2x(&prev.image, &prev.mask);
        levels.push(PyramidLevel { image: img, mask: msk });
    }
    levels
}

/// Disk cache file magic for one pyramid level.
const CACHE_MAGIC: &[u8; 4] = b"APY1";

fn write_level_disk(path: &Path, level: &PyramidLevel) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(CACHE_MAGIC)?;
        f.write_u32::<LittleEndian>(level.image.width as u32)?;
        f.write_u32::<LittleEndian>(level.image.height as u32)?;
        f.write_all(&level.image.pixels)?;
        f.write_all(&level.mask.bytes)?;
    }
    // Rename gives readers an all-or-nothing view of the cache entry (§5).
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_level_disk(path: &Path) -> Result<PyramidLevel> {
    let mut f = std::fs::File::open(path)?;
    let mut magic = [0u8; 4];
    f.read_exact(&mut magic)?;
    if &magic != CACHE_MAGIC {
        return Err(AlignError::FormatError(format!(
            "bad pyramid cache magic in {}",
            path.display()
        )));
    }
    let width = f.read_u32::<LittleEndian>()? as usize;
    let height = f.read_u32::<LittleEndian>()? as usize;
    let mut pixels = vec![0u8; width * height];
    f.read_exact(&mut pixels)?;
    let stride = Bitmap::row_stride(width);
    let mut mask_bytes = vec![0u8; stride * height];
    f.read_exact(&mut mask_bytes)?;
    Ok(PyramidLevel {
        image: GrayImage::from_pixels(width, height, pixels)?,
        mask: Bitmap::from_bytes(width, height, mask_bytes)?,
    })
}

type CacheKey = (String, usize);

struct LruState {
    entries: HashMap<CacheKey, Arc<PyramidLevel>>,
    order: VecDeque<CacheKey>,
    used_bytes: usize,
}

/// Shared pyramid/mask store: an in-memory, byte-budgeted LRU in front of
/// an optional on-disk cache directory.
pub struct PyramidStore {
    cache_dir: Option<PathBuf>,
    budget_bytes: usize,
    state: Mutex<LruState>,
}

impl PyramidStore {
    pub fn new(cache_dir: Option<PathBuf>, budget_bytes: usize) -> Self {
        Self {
            cache_dir,
            budget_bytes,
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                order: VecDeque::new(),
                used_bytes: 0,
            }),
        }
    }

    fn disk_path(&self, image_name: &str, level: usize) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{image_name}.L{level}.pyr")))
    }

    fn touch(state: &mut LruState, key: &CacheKey) {
        if let Some(pos) = state.order.iter().position(|k| k == key) {
            state.order.remove(pos);
        }
        state.order.push_back(key.clone());
    }

    fn insert(&self, state: &mut LruState, key: CacheKey, level: Arc<PyramidLevel>) {
        let bytes = level.approx_bytes();
        state.used_bytes += bytes;
        state.entries.insert(key.clone(), level);
        state.order.push_back(key);
        while state.used_bytes > self.budget_bytes {
            // Never evict the single most-recently-touched entry, so a
            // pair's active coarse-to-fine loop keeps at least its
            // current level pinned even under a tight budget.
            if state.order.len() <= 1 {
                break;
            }
            let Some(evict_key) = state.order.pop_front() else {
                break;
            };
            if let Some(evicted) = state.entries.remove(&evict_key) {
                state.used_bytes = state.used_bytes.saturating_sub(evicted.approx_bytes());
                debug!(image = %evict_key.0, level = evict_key.1, "evicted pyramid level from memory cache");
            }
        }
    }

    /// Get level `level` of `image_name`, building (and caching) any
    /// missing levels from level 0 up via [`downsample_2x`]. `source`
    /// lazily produces the level-0 `(image, mask)` pair; it is invoked at
    /// most once regardless of how many levels are requested.
    pub fn get_level(
        &self,
        image_name: &str,
        level: usize,
        source: &dyn Fn() -> Result<(GrayImage, Bitmap)>,
    ) -> Result<Arc<PyramidLevel>> {
        let key = (image_name.to_string(), level);
        {
            let mut state = self.state.lock().unwrap();
            if let Some(found) = state.entries.get(&key).cloned() {
                Self::touch(&mut state, &key);
                return Ok(found);
            }
        }

        if let Some(path) = self.disk_path(image_name, level) {
            if path.exists() {
                let lvl = Arc::new(read_level_disk(&path)?);
                let mut state = self.state.lock().unwrap();
                self.insert(&mut state, key, lvl.clone());
                return Ok(lvl);
            }
        }

        let built = if level == 0 {
            let (image, mask) = source()?;
            PyramidLevel { image, mask }
        } else {
            let prev = self.get_level(image_name, level - 1, source)?;
            if prev.image.width == 1 || prev.image.height == 1 {
                return Err(AlignError::Degenerate(format!(
                    "pyramid level {level} requested past 1-pixel floor for {image_name}"
                )));
            }
            let (image, mask) = downsample_2x(&prev.image, &prev.mask);
            PyramidLevel { image, mask }
        };

        if let Some(path) = self.disk_path(image_name, level) {
            write_level_disk(&path, &built)?;
        }

        let built = Arc::new(built);
        let mut state = self.state.lock().unwrap();
        self.insert(&mut state, key, built.clone());
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(w: usize, h: usize) -> GrayImage {
        let mut img = GrayImage::new(w, h);
        for y in 0..h {
            for x in 0..w {
                img.set(x, y, if (x + y) % 2 == 0 { 255 } else { 0 });
            }
        }
        img
    }

    #[test]
    fn level_dimensions_match_formula() {
        let img = checkerboard(37, 23);
        let mask = Bitmap::all_valid(37, 23);
        let levels = build_pyramid(img, mask, 4);
        for (k, level) in levels.iter().enumerate() {
            let expected_w = (37usize).div_ceil(1usize << k);
            let expected_h = (23usize).div_ceil(1usize << k);
            assert_eq!(level.image.width, expected_w, "level {k} width");
            assert_eq!(level.image.height, expected_h, "level {k} height");
        }
    }

    #[test]
    fn mask_or_property_holds() {
        let img = checkerboard(16, 16);
        let mut mask = Bitmap::all_valid(16, 16);
        mask.set(0, 0, false);
        mask.set(1, 0, false);
        mask.set(0, 1, false);
        mask.set(1, 1, true);
        let (_, out_mask) = downsample_2x(&img, &mask);
        // Top-left 2x2 block has one valid contributor -> OR is true.
        assert!(out_mask.get(0, 0));
    }

    #[test]
    fn stops_at_one_pixel_dimension() {
        let img = checkerboard(1, 40);
        let mask = Bitmap::all_valid(1, 40);
        let levels = build_pyramid(img, mask, 10);
        assert!(levels.iter().all(|l| l.image.width == 1));
        assert!(levels.len() < 11);
    }

    #[test]
    fn store_builds_and_caches_levels() {
        let dir = tempfile::tempdir().unwrap();
        let store = PyramidStore::new(Some(dir.path().to_path_buf()), 1024 * 1024);
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let loader = || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok((checkerboard(64, 64), Bitmap::all_valid(64, 64)))
        };

        let l0 = store.get_level("imgA", 0, &loader).unwrap();
        let l2 = store.get_level("imgA", 2, &loader).unwrap();
        assert_eq!(l0.image.width, 64);
        assert_eq!(l2.image.width, 16);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // A second store sharing the same disk cache dir should not need
        // the loader at all.
        let store2 = PyramidStore::new(Some(dir.path().to_path_buf()), 1024 * 1024);
        let unreachable = || -> Result<(GrayImage, Bitmap)> {
            panic!("loader should not be invoked when disk cache is populated")
        };
        let l2_again = store2.get_level("imgA", 2, &unreachable).unwrap();
        assert_eq!(l2_again.image.pixels, l2.image.pixels);
    }
}
