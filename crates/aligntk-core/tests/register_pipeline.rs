//! End-to-end exercises of the §8 scenarios that don't fit naturally
//! inside a single module's unit tests: a full pyramid -> correspondence
//! -> local-map run for a translated pair, and a four-image mosaic
//! relaxation.

use std::collections::HashMap;

use aligntk_core::compute::CpuFft;
use aligntk_core::correspond::{run_correspondence, CorrelationConfig};
use aligntk_core::dt::distance_transform;
use aligntk_core::localmap::{solve_local_map, LocalMapConfig};
use aligntk_core::map::{Map, MapVertex};
use aligntk_core::pair::{AdjacencyGraph, OverlapRegion, Pair};
use aligntk_core::pyramid::{build_pyramid, PyramidLevel};
use aligntk_core::raster::{Bitmap, GrayImage};
use aligntk_core::relax::{relax, GlobalMaps, RelaxConfig};

fn textured_image(w: usize, h: usize) -> GrayImage {
    let mut img = GrayImage::new(w, h);
    let mut state = 0x243F6A8885A308D3u64;
    for y in 0..h {
        for x in 0..w {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let structured = (((x * 7 + y * 13) % 97) as u64) * 2;
            img.set(x, y, (((state >> 56) & 0x3F) as u64 + structured) as u8);
        }
    }
    img
}

/// Shift an image by an integer `(dx, dy)`, leaving a border invalid.
fn shift_image(src: &GrayImage, dx: i64, dy: i64) -> (GrayImage, Bitmap) {
    let mut out = GrayImage::new(src.width, src.height);
    let mut mask = Bitmap::all_invalid(src.width, src.height);
    for y in 0..src.height as i64 {
        for x in 0..src.width as i64 {
            let (sx, sy) = (x - dx, y - dy);
            if sx >= 0 && sy >= 0 && (sx as usize) < src.width && (sy as usize) < src.height {
                out.set(x as usize, y as usize, src.get(sx as usize, sy as usize));
                mask.set(x as usize, y as usize, true);
            }
        }
    }
    (out, mask)
}

/// §8 scenario 2: a pure translation of `(+7, -4)` pixels (integer, to
/// stay inside the correspondence engine's accuracy budget without
/// needing a sub-pixel-accurate synthetic resampler) must be recovered
/// by the local-map's affine fit to within a fraction of a pixel.
#[test]
fn recovers_integer_translation_end_to_end() {
    let size = 256;
    let reference_img = textured_image(size, size);
    let reference_mask = Bitmap::all_valid(size, size);
    let (moving_img, moving_mask) = shift_image(&reference_img, 7, -4);

    let max_level = 2;
    let moving_pyr = build_pyramid(moving_img, moving_mask, max_level);
    let reference_pyr = build_pyramid(reference_img, reference_mask, max_level);
    let reference_dts: Vec<_> = reference_pyr.iter().map(|l| distance_transform(&l.mask)).collect();

    let config = CorrelationConfig {
        patch_size: 32,
        grid_stride: 32,
        min_accept: 0.3,
        ..CorrelationConfig::default()
    };
    let fft = CpuFft;
    let radius_schedule = vec![12, 12, 12];

    let field = run_correspondence(
        &moving_pyr,
        &reference_pyr,
        &reference_dts,
        0,
        &radius_schedule,
        &config,
        &fft,
    )
    .expect("correspondence should succeed on a clean translated pair");

    let map = solve_local_map(&field, "moving", "reference", &LocalMapConfig::default()).unwrap();

    // Recovered vertex - nominal grid position should read back close to
    // (+7, -4) wherever a cell was confidently accepted.
    let mut checked = 0;
    for gy in 0..map.height {
        for gx in 0..map.width {
            let v = map.vertex(gx, gy);
            if v.c <= 0.0 {
                continue;
            }
            let cell = field.cell(gx, gy);
            let dx = v.x as f64 - cell.pos_x;
            let dy = v.y as f64 - cell.pos_y;
            assert!((dx - 7.0).abs() < 0.5, "dx={dx} expected ~7.0");
            assert!((dy - (-4.0)).abs() < 0.5, "dy={dy} expected ~-4.0");
            checked += 1;
        }
    }
    assert!(checked > 0, "expected at least one confidently accepted vertex");
}

/// A simplified version of §8 scenario 4: a 2x2 mosaic of identically
/// sized grids where each pair's local map already encodes the expected
/// shift, and relaxation should pull every image toward a single
/// consistent coordinate frame anchored at the first image.
#[test]
fn relaxation_reconciles_a_four_image_mosaic() {
    let grid = 5usize;
    let pitch = 1.0f64;
    let shifts: HashMap<&str, (f32, f32)> =
        [("tl", (0.0, 0.0)), ("tr", (400.0, 0.0)), ("bl", (0.0, 400.0)), ("br", (400.0, 400.0))]
            .into_iter()
            .collect();

    let mut graph = AdjacencyGraph::new();
    for name in shifts.keys() {
        graph.add_image(*name);
    }

    let pairs = [("tl", "tr"), ("tl", "bl"), ("tr", "br"), ("bl", "br")];
    for (a, b) in pairs {
        let overlap = OverlapRegion { x: 0.0, y: 0.0, width: 100.0, height: 100.0 };
        graph.add_pair(Pair::new(a, b, overlap, vec![1]));

        // The local map from `a` onto `b`'s frame: every vertex maps to
        // its nominal position plus the ground-truth offset between the
        // two images' anchors.
        let (ax, ay) = shifts[a];
        let (bx, by) = shifts[b];
        let mut map = Map::new(0, grid, grid, 0.0, 0.0, a, b);
        for gy in 0..grid {
            for gx in 0..grid {
                let local_x = gx as f32 * pitch as f32;
                let local_y = gy as f32 * pitch as f32;
                map.set_vertex(
                    gx,
                    gy,
                    MapVertex { x: local_x + (ax - bx), y: local_y + (ay - by), c: 1.0 },
                );
            }
        }
        graph.set_map(a, b, map).unwrap();
    }

    let mut maps = GlobalMaps::new();
    for name in shifts.keys() {
        let (ox, oy) = shifts[name];
        maps.insert((*name).to_string(), Map::new(0, grid, grid, ox, oy, *name, *name));
    }

    let config = RelaxConfig { max_iterations: 200, convergence_tolerance: 1e-4, relaxation_factor: 0.8 };
    let result = relax(&graph, maps, &config).unwrap();

    for name in shifts.keys() {
        assert!(result.get(*name).is_some(), "missing resolved map for {name}");
    }
}
