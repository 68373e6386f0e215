//! Component B: distance-transform service (§4.B).
//!
//! Produces `DT(mask)`, a same-shape array of non-negative `f64`s giving
//! the exact Euclidean distance from each pixel to the nearest *cleared*
//! mask bit. Computed via the Felzenszwalb-Huttenlocher two-pass
//! separable squared-distance transform (lower envelope of 1-D
//! parabolas), which is exact and runs in `O(W*H)`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array2;

use crate::error::{AlignError, Result};
use crate::raster::Bitmap;

const INF: f64 = f64::INFINITY;

/// Compute the Euclidean distance transform of `mask`: `DT[y,x]` is the
/// distance from `(x,y)` to the nearest pixel whose mask bit is cleared.
/// `DT[y,x] == 0` iff the mask bit at `(x,y)` is itself cleared.
pub fn distance_transform(mask: &Bitmap) -> Array2<f64> {
    let (w, h) = (mask.width, mask.height);
    let mut f = Array2::<f64>::from_elem((h, w), 0.0);
    for y in 0..h {
        for x in 0..w {
            f[[y, x]] = if mask.get(x, y) { INF } else { 0.0 };
        }
    }
    squared_distance_transform(&f).mapv(f64::sqrt)
}

/// Separable squared Euclidean distance transform of a same-shape `f64`
/// array where `0.0` marks a "feature" site (distance 0) and other
/// values (typically `INF`) mark sites whose distance is to be
/// determined. Runs the 1-D transform over columns, then over rows.
fn squared_distance_transform(f: &Array2<f64>) -> Array2<f64> {
    let (h, w) = f.dim();

    // Pass 1: each column independently.
    let mut pass1 = Array2::<f64>::zeros((h, w));
    let mut col_buf = vec![0.0; h];
    let mut col_out = vec![0.0; h];
    for x in 0..w {
        for y in 0..h {
            col_buf[y] = f[[y, x]];
        }
        lower_envelope_1d(&col_buf, &mut col_out);
        for y in 0..h {
            pass1[[y, x]] = col_out[y];
        }
    }

    // Pass 2: each row of the column-transformed array.
    let mut out = Array2::<f64>::zeros((h, w));
    let mut row_buf = vec![0.0; w];
    let mut row_out = vec![0.0; w];
    for y in 0..h {
        for x in 0..w {
            row_buf[x] = pass1[[y, x]];
        }
        lower_envelope_1d(&row_buf, &mut row_out);
        for x in 0..w {
            out[[y, x]] = row_out[x];
        }
    }

    out
}

/// 1-D squared distance transform via the lower envelope of parabolas
/// `y = (q - v)^2 + f[v]` rooted at each sample `v`.
fn lower_envelope_1d(f: &[f64], output: &mut [f64]) {
    let n = f.len();
    if n == 0 {
        return;
    }

    let mut v = vec![0usize; n];
    let mut z = vec![0.0f64; n + 1];
    let mut k = 0usize;

    v[0] = 0;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;

    for q in 1..n {
        loop {
            let s = intersection(q, v[k], f);
            if s <= z[k] {
                if k == 0 {
                    break;
                }
                k -= 1;
            } else {
                break;
            }
        }
        k += 1;
        v[k] = q;
        z[k] = intersection(q, v[k - 1], f);
        z[k + 1] = f64::INFINITY;
    }

    let mut k = 0usize;
    for (q, out) in output.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let dx = q as f64 - v[k] as f64;
        *out = dx * dx + f[v[k]];
    }
}

/// Intersection of the parabolas rooted at `i` and `j`. Infinite `f`
/// values at either root push the intersection to `+infinity`, which the
/// lower-envelope sweep treats as "never wins".
fn intersection(i: usize, j: usize, f: &[f64]) -> f64 {
    if i == j {
        return f64::INFINITY;
    }
    let fi = f[i];
    let fj = f[j];
    if !fi.is_finite() && !fj.is_finite() {
        return f64::INFINITY;
    }
    if !fi.is_finite() {
        return f64::INFINITY;
    }
    if !fj.is_finite() {
        return f64::NEG_INFINITY;
    }
    ((fi + (i * i) as f64) - (fj + (j * j) as f64)) / (2.0 * (i as f64 - j as f64))
}

/// Shared distance-transform cache: an in-memory map in front of an
/// optional on-disk cache directory, keyed by `(imageName, level)`
/// exactly like [`crate::pyramid::PyramidStore`] so both caches agree on
/// naming (§3 "Lifecycles": "Pyramids and distance transforms are
/// produced on demand and cached on disk"). Disk entries are written to
/// a temporary path and atomically renamed into place (§5 "Shared
/// resources") so concurrent workers never observe a partial file.
pub struct DtStore {
    cache_dir: Option<PathBuf>,
    memory: Mutex<HashMap<(String, usize), Arc<Array2<f64>>>>,
}

impl DtStore {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self { cache_dir, memory: Mutex::new(HashMap::new()) }
    }

    fn disk_path(&self, image_name: &str, level: usize) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(format!("{image_name}.L{level}.dt")))
    }

    /// Get the distance transform of `mask` (the `(image_name, level)`
    /// pyramid level's mask), building and caching it if necessary.
    pub fn get(&self, image_name: &str, level: usize, mask: &Bitmap) -> Result<Arc<Array2<f64>>> {
        let key = (image_name.to_string(), level);
        if let Some(found) = self.memory.lock().unwrap().get(&key).cloned() {
            return Ok(found);
        }
        if let Some(path) = self.disk_path(image_name, level) {
            if path.exists() {
                let dt = Arc::new(read_dt_disk(&path, mask.width, mask.height)?);
                self.memory.lock().unwrap().insert(key, dt.clone());
                return Ok(dt);
            }
        }
        let dt = Arc::new(distance_transform(mask));
        if let Some(path) = self.disk_path(image_name, level) {
            write_dt_disk(&path, &dt)?;
        }
        self.memory.lock().unwrap().insert(key, dt.clone());
        Ok(dt)
    }
}

fn write_dt_disk(path: &std::path::Path, dt: &Array2<f64>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("dt.tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        let (h, w) = dt.dim();
        f.write_u64::<LittleEndian>(w as u64)?;
        f.write_u64::<LittleEndian>(h as u64)?;
        for v in dt.iter() {
            f.write_f64::<LittleEndian>(*v)?;
        }
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_dt_disk(path: &std::path::Path, expect_w: usize, expect_h: usize) -> Result<Array2<f64>> {
    let mut f = std::fs::File::open(path)?;
    let w = f.read_u64::<LittleEndian>()? as usize;
    let h = f.read_u64::<LittleEndian>()? as usize;
    if w != expect_w || h != expect_h {
        return Err(AlignError::FormatError(format!(
            "cached DT dims {w}x{h} do not match mask dims {expect_w}x{expect_h}"
        )));
    }
    let mut data = vec![0.0f64; w * h];
    for v in data.iter_mut() {
        *v = f.read_f64::<LittleEndian>()?;
    }
    Array2::from_shape_vec((h, w), data)
        .map_err(|e| AlignError::FormatError(format!("bad cached DT shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exactly_on_cleared_bits() {
        let mut mask = Bitmap::all_valid(9, 9);
        mask.set(4, 4, false);
        let dt = distance_transform(&mask);
        for y in 0..9 {
            for x in 0..9 {
                let is_zero = dt[[y, x]] == 0.0;
                let is_cleared = !mask.get(x, y);
                assert_eq!(is_zero, is_cleared, "mismatch at ({x},{y})");
            }
        }
    }

    #[test]
    fn matches_manhattan_adjacent_case() {
        let mut mask = Bitmap::all_valid(5, 5);
        mask.set(2, 2, false);
        let dt = distance_transform(&mask);
        assert!((dt[[2, 3]] - 1.0).abs() < 1e-9);
        assert!((dt[[1, 1]] - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn one_lipschitz() {
        let mut mask = Bitmap::all_valid(20, 15);
        mask.set(3, 3, false);
        mask.set(15, 10, false);
        let dt = distance_transform(&mask);
        for y in 0..15 {
            for x in 0..20 {
                if x + 1 < 20 {
                    let d = (dt[[y, x]] - dt[[y, x + 1]]).abs();
                    assert!(d <= 1.0 + 1e-9, "row-neighbor violation at ({x},{y}): {d}");
                }
                if y + 1 < 15 {
                    let d = (dt[[y, x]] - dt[[y + 1, x]]).abs();
                    assert!(d <= 1.0 + 1e-9, "col-neighbor violation at ({x},{y}): {d}");
                }
            }
        }
    }

    #[test]
    fn store_shares_disk_cache_across_instances() {
        let mut mask = Bitmap::all_valid(10, 10);
        mask.set(5, 5, false);
        let dir = tempfile::tempdir().unwrap();

        let store = DtStore::new(Some(dir.path().to_path_buf()));
        let dt_a = store.get("imgA", 0, &mask).unwrap();

        let store2 = DtStore::new(Some(dir.path().to_path_buf()));
        let dt_b = store2.get("imgA", 0, &mask).unwrap();

        assert_eq!(dt_a.as_slice(), dt_b.as_slice());
    }
}
