//! The deformation-grid `Map` data type and its "M1" on-disk format
//! (§3 "Map (deformation grid)", §6 "Map file format").
//!
//! A map is a regular `mw x mh` grid of vertices covering some pyramid
//! level of an image. Each vertex stores `(x, y, c)`: its current
//! floating-point position in the reference frame, and a confidence in
//! `[0, 1]`. The on-disk format is a small ASCII header followed by the
//! raw vertex array in the producing host's native byte order — per
//! Design Note 9, this crate does not silently standardize on
//! little-endian; readers must run on a host with the same endianness
//! as the writer.

use std::io::{Read, Write};
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{AlignError, Result};

/// One grid vertex: a reference-frame position and a confidence weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapVertex {
    pub x: f32,
    pub y: f32,
    pub c: f32,
}

impl MapVertex {
    pub const ZERO: MapVertex = MapVertex { x: 0.0, y: 0.0, c: 0.0 };
}

/// A dense deformation map for one image at one pyramid level.
#[derive(Clone, Debug, PartialEq)]
pub struct Map {
    pub level: usize,
    pub width: usize,
    pub height: usize,
    pub x_min: f32,
    pub y_min: f32,
    pub image_name: String,
    pub reference_name: String,
    /// Row-major, `width * height` vertices.
    pub vertices: Vec<MapVertex>,
}

impl Map {
    pub fn new(
        level: usize,
        width: usize,
        height: usize,
        x_min: f32,
        y_min: f32,
        image_name: impl Into<String>,
        reference_name: impl Into<String>,
    ) -> Self {
        Self {
            level,
            width,
            height,
            x_min,
            y_min,
            image_name: image_name.into(),
            reference_name: reference_name.into(),
            vertices: vec![MapVertex::ZERO; width * height],
        }
    }

    #[inline]
    pub fn index(&self, ix: usize, iy: usize) -> usize {
        iy * self.width + ix
    }

    #[inline]
    pub fn vertex(&self, ix: usize, iy: usize) -> MapVertex {
        self.vertices[self.index(ix, iy)]
    }

    #[inline]
    pub fn set_vertex(&mut self, ix: usize, iy: usize, v: MapVertex) {
        let idx = self.index(ix, iy);
        self.vertices[idx] = v;
    }

    /// Grid spacing at this map's level, in level-0 pixels: a power-of-two
    /// multiple of the level's own pixel pitch (§3).
    pub fn pixel_pitch(&self) -> f64 {
        (1usize << self.level) as f64
    }

    /// Validate the §3 invariant "for any vertex with c>0, (x,y) lies
    /// within the reference image extents of the declared level".
    pub fn validate_within(&self, ref_level_width: usize, ref_level_height: usize) -> Result<()> {
        for v in &self.vertices {
            if v.c > 0.0
                && (v.x < 0.0
                    || v.y < 0.0
                    || v.x > ref_level_width as f32
                    || v.y > ref_level_height as f32)
            {
                return Err(AlignError::Degenerate(format!(
                    "map vertex ({}, {}) with c={} lies outside reference extents {}x{}",
                    v.x, v.y, v.c, ref_level_width, ref_level_height
                )));
            }
        }
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AlignError::InputMissing(path.display().to_string()));
        }
        let data = std::fs::read(path)?;
        let mut cursor = &data[..];

        let magic = read_line(&mut cursor)?;
        if magic != "M1" {
            return Err(AlignError::FormatError(format!(
                "bad map magic: expected \"M1\", got {magic:?}"
            )));
        }
        let level: usize = read_line(&mut cursor)?
            .parse()
            .map_err(|_| AlignError::FormatError("invalid level field".into()))?;
        let dims_line = read_line(&mut cursor)?;
        let mut dims = dims_line.split_whitespace();
        let width: usize = parse_field(dims.next(), "mapWidth")?;
        let height: usize = parse_field(dims.next(), "mapHeight")?;

        let origin_line = read_line(&mut cursor)?;
        let mut origin = origin_line.split_whitespace();
        let x_min: f32 = parse_field(origin.next(), "xMin")?;
        let y_min: f32 = parse_field(origin.next(), "yMin")?;

        let names_line = read_line(&mut cursor)?;
        let mut names = names_line.split_whitespace();
        let image_name = names
            .next()
            .ok_or_else(|| AlignError::FormatError("missing imageName".into()))?
            .to_string();
        let reference_name = names
            .next()
            .ok_or_else(|| AlignError::FormatError("missing referenceName".into()))?
            .to_string();

        let expected_count = width * height;
        let expected_bytes = expected_count * 12; // 3 x f32
        if cursor.len() != expected_bytes {
            return Err(AlignError::FormatError(format!(
                "map body size {} does not match mw*mh ({}) * 12 = {}",
                cursor.len(),
                expected_count,
                expected_bytes
            )));
        }

        let mut vertices = Vec::with_capacity(expected_count);
        for _ in 0..expected_count {
            let x = cursor.read_f32::<NativeEndian>()?;
            let y = cursor.read_f32::<NativeEndian>()?;
            let c = cursor.read_f32::<NativeEndian>()?;
            vertices.push(MapVertex { x, y, c });
        }

        Ok(Self {
            level,
            width,
            height,
            x_min,
            y_min,
            image_name,
            reference_name,
            vertices,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if self.vertices.len() != self.width * self.height {
            return Err(AlignError::FormatError(format!(
                "map vertex count {} does not match {}x{}",
                self.vertices.len(),
                self.width,
                self.height
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::File::create(path)?;
        write!(f, "M1\n{}\n{} {}\n{} {}\n{} {}\n",
            self.level, self.width, self.height, self.x_min, self.y_min,
            self.image_name, self.reference_name)?;
        for v in &self.vertices {
            f.write_f32::<NativeEndian>(v.x)?;
            f.write_f32::<NativeEndian>(v.y)?;
            f.write_f32::<NativeEndian>(v.c)?;
        }
        Ok(())
    }
}

fn read_line(cursor: &mut &[u8]) -> Result<String> {
    let pos = cursor
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| AlignError::FormatError("truncated map header".into()))?;
    let line = std::str::from_utf8(&cursor[..pos])
        .map_err(|_| AlignError::FormatError("non-ASCII map header line".into()))?
        .to_string();
    *cursor = &cursor[pos + 1..];
    Ok(line)
}

fn parse_field<T: std::str::FromStr>(token: Option<&str>, name: &str) -> Result<T> {
    token
        .ok_or_else(|| AlignError::FormatError(format!("missing {name} field")))?
        .parse()
        .map_err(|_| AlignError::FormatError(format!("invalid {name} field")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_bit_exact() {
        let mut map = Map::new(2, 4, 3, 10.5, -3.25, "tile_0012", "ref_mosaic");
        for iy in 0..3 {
            for ix in 0..4 {
                map.set_vertex(
                    ix,
                    iy,
                    MapVertex {
                        x: ix as f32 * 4.0 + 0.125,
                        y: iy as f32 * 4.0 - 0.375,
                        c: 0.5,
                    },
                );
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pair.map");
        map.write(&path).unwrap();
        let read_back = Map::read(&path).unwrap();
        assert_eq!(map, read_back);
    }

    #[test]
    fn rejects_truncated_body() {
        let map = Map::new(0, 2, 2, 0.0, 0.0, "a", "b");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pair.map");
        map.write(&path).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.pop();
        std::fs::write(&path, bytes).unwrap();
        assert!(Map::read(&path).is_err());
    }

    #[test]
    fn validate_within_rejects_out_of_bounds_confident_vertex() {
        let mut map = Map::new(0, 2, 2, 0.0, 0.0, "a", "b");
        map.set_vertex(0, 0, MapVertex { x: -5.0, y: 0.0, c: 1.0 });
        assert!(map.validate_within(100, 100).is_err());

        let mut map2 = Map::new(0, 2, 2, 0.0, 0.0, "a", "b");
        map2.set_vertex(0, 0, MapVertex { x: -5.0, y: 0.0, c: 0.0 });
        assert!(map2.validate_within(100, 100).is_ok());
    }
}
