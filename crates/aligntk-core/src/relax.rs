//! Component E: the global relaxation solver (§4.E).
//!
//! Turns the set of pairwise [`Map`]s held by an [`AdjacencyGraph`] into
//! one consistent per-image global map by iterative Gauss-Seidel
//! averaging: each image's grid vertices are pulled toward the position
//! implied by every neighboring image's already-resolved global map,
//! sampled through that pair's local map. Same-color images (from
//! [`AdjacencyGraph::color_classes`]) never share an edge, so a whole
//! color class updates concurrently with Rayon without two writers
//! racing on a shared constraint. A multigrid outer loop runs this from
//! the coarsest level a caller supplies down to the finest, doubling the
//! previous level's solution to seed the next.

use std::collections::{HashMap, VecDeque};

use rayon::prelude::*;

use crate::error::{AlignError, Result};
use crate::map::{Map, MapVertex};
use crate::pair::AdjacencyGraph;

/// Tunables for one level's relaxation solve.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RelaxConfig {
    pub max_iterations: usize,
    /// Stop once the largest vertex movement in a sweep drops below this,
    /// in pixels at the level's pitch.
    pub convergence_tolerance: f64,
    /// Under-relaxation factor in `(0, 1]`; 1.0 takes the full Gauss-Seidel
    /// step, smaller values damp oscillation on loosely-constrained graphs.
    pub relaxation_factor: f64,
}

impl Default for RelaxConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            convergence_tolerance: 1e-3,
            relaxation_factor: 0.5,
        }
    }
}

/// The current best estimate of every image's global map at one level.
pub type GlobalMaps = HashMap<String, Map>;

/// Sample a map's vertex grid at a continuous pixel position in the
/// map's own domain (bilinear interpolation over `vertices`, clamped to
/// the grid's edge). Returns `None` if the position falls entirely
/// outside the grid's 0-confidence region.
fn sample(map: &Map, px: f64, py: f64) -> Option<(f64, f64, f32)> {
    let pitch = map.pixel_pitch();
    let fx = (px - map.x_min as f64) / pitch;
    let fy = (py - map.y_min as f64) / pitch;
    if map.width < 2 || map.height < 2 {
        let v = map.vertex(0, 0);
        return Some((v.x as f64, v.y as f64, v.c));
    }
    let fx = fx.clamp(0.0, (map.width - 1) as f64);
    let fy = fy.clamp(0.0, (map.height - 1) as f64);
    let gx0 = fx.floor() as usize;
    let gy0 = fy.floor() as usize;
    let gx1 = (gx0 + 1).min(map.width - 1);
    let gy1 = (gy0 + 1).min(map.height - 1);
    let tx = fx - gx0 as f64;
    let ty = fy - gy0 as f64;

    let v00 = map.vertex(gx0, gy0);
    let v10 = map.vertex(gx1, gy0);
    let v01 = map.vertex(gx0, gy1);
    let v11 = map.vertex(gx1, gy1);

    let blend = |a: f32, b: f32, c: f32, d: f32| -> f64 {
        a as f64 * (1.0 - tx) * (1.0 - ty)
            + b as f64 * tx * (1.0 - ty)
            + c as f64 * (1.0 - tx) * ty
            + d as f64 * tx * ty
    };

    let x = blend(v00.x, v10.x, v01.x, v11.x);
    let y = blend(v00.y, v10.y, v01.y, v11.y);
    let c = blend(v00.c, v10.c, v01.c, v11.c) as f32;
    Some((x, y, c))
}

/// Build an approximate inverse of a local map by scatter-splatting each
/// source grid vertex's pixel position into the target cell its value
/// lands in, then normalizing by accumulated confidence weight. Used to
/// propagate a constraint along a pair edge in the reference->moving
/// direction, since pair maps are only ever stored moving->reference.
fn approximate_inverse(map: &Map) -> Map {
    let pitch = map.pixel_pitch();
    let mut sum_x = vec![0.0f64; map.width * map.height];
    let mut sum_y = vec![0.0f64; map.width * map.height];
    let mut weight = vec![0.0f64; map.width * map.height];

    for gy in 0..map.height {
        for gx in 0..map.width {
            let v = map.vertex(gx, gy);
            if v.c <= 0.0 {
                continue;
            }
            let fx = ((v.x as f64 - map.x_min as f64) / pitch).clamp(0.0, (map.width - 1) as f64);
            let fy = ((v.y as f64 - map.y_min as f64) / pitch).clamp(0.0, (map.height - 1) as f64);
            let tx0 = fx.floor() as usize;
            let ty0 = fy.floor() as usize;
            let tx1 = (tx0 + 1).min(map.width - 1);
            let ty1 = (ty0 + 1).min(map.height - 1);
            let fracx = fx - tx0 as f64;
            let fracy = fy - ty0 as f64;
            let src_x = map.x_min as f64 + gx as f64 * pitch;
            let src_y = map.y_min as f64 + gy as f64 * pitch;

            let mut splat = |tgx: usize, tgy: usize, w: f64| {
                let idx = tgy * map.width + tgx;
                let ww = w * v.c as f64;
                sum_x[idx] += src_x * ww;
                sum_y[idx] += src_y * ww;
                weight[idx] += ww;
            };
            splat(tx0, ty0, (1.0 - fracx) * (1.0 - fracy));
            splat(tx1, ty0, fracx * (1.0 - fracy));
            splat(tx0, ty1, (1.0 - fracx) * fracy);
            splat(tx1, ty1, fracx * fracy);
        }
    }

    let mut inverse = Map::new(map.level, map.width, map.height, map.x_min, map.y_min, &map.reference_name, &map.image_name);
    for gy in 0..map.height {
        for gx in 0..map.width {
            let idx = gy * map.width + gx;
            if weight[idx] > 1e-9 {
                inverse.set_vertex(
                    gx,
                    gy,
                    MapVertex {
                        x: (sum_x[idx] / weight[idx]) as f32,
                        y: (sum_y[idx] / weight[idx]) as f32,
                        c: weight[idx].min(1.0) as f32,
                    },
                );
            }
        }
    }
    inverse
}

/// Contributions collected for one image's vertices from every pair edge
/// touching it, keyed by the direction the constraint came from.
enum Constraint<'a> {
    /// `image` is the moving side; sample `reference`'s global map
    /// through the forward local map.
    Forward { reference: &'a str, local: &'a Map },
    /// `image` is the reference side; sample `moving`'s global map
    /// through the local map's scatter-built approximate inverse.
    Reverse { moving: &'a str, inverse: Map },
}

fn collect_constraints<'a>(graph: &'a AdjacencyGraph, image: &str) -> Vec<Constraint<'a>> {
    let mut out = Vec::new();
    for pair in graph.pairs_touching(image) {
        if pair.moving == image {
            if let Some(local) = graph.map_for(&pair.moving, &pair.reference) {
                out.push(Constraint::Forward { reference: &pair.reference, local });
            }
        } else if let Some(local) = graph.map_for(&pair.moving, &pair.reference) {
            out.push(Constraint::Reverse { moving: &pair.moving, inverse: approximate_inverse(local) });
        }
    }
    out
}

/// Seed every image's global map as the identity (each grid vertex maps
/// to its own pixel position, confidence 1) over the grid described by
/// `(level, grid_w, grid_h, x_min, y_min)`.
fn seed_identity(graph: &AdjacencyGraph, level: usize, grid_w: usize, grid_h: usize, x_min: f32, y_min: f32) -> GlobalMaps {
    let pitch = (1u64 << level) as f32;
    let mut maps = GlobalMaps::new();
    for image in graph.images() {
        let mut map = Map::new(level, grid_w, grid_h, x_min, y_min, image.clone(), "global");
        for gy in 0..grid_h {
            for gx in 0..grid_w {
                map.set_vertex(
                    gx,
                    gy,
                    MapVertex { x: x_min + gx as f32 * pitch, y: y_min + gy as f32 * pitch, c: 1.0 },
                );
            }
        }
        maps.insert(image.clone(), map);
    }
    maps
}

/// Run Gauss-Seidel relaxation to convergence (or `max_iterations`) on
/// `graph`'s pairwise maps, starting from `initial` (identity-seeded, or
/// the upsampled solution from a coarser level). Anchors `graph.images()[0]`
/// as fixed (pinned to its initial, never updated) so the system has a
/// unique solution instead of drifting as a whole.
pub fn relax(graph: &AdjacencyGraph, mut maps: GlobalMaps, config: &RelaxConfig) -> Result<GlobalMaps> {
    let anchor = graph
        .images()
        .first()
        .ok_or_else(|| AlignError::Degenerate("adjacency graph has no images".into()))?
        .clone();

    let classes = graph.color_classes();

    for _ in 0..config.max_iterations {
        let mut max_delta = 0.0f64;

        for class in &classes {
            let updates: Vec<(String, Map)> = class
                .par_iter()
                .filter(|image| **image != anchor)
                .filter_map(|image| {
                    let current = maps.get(image)?;
                    let constraints = collect_constraints(graph, image);
                    if constraints.is_empty() {
                        return None;
                    }
                    let mut updated = current.clone();
                    for gy in 0..current.height {
                        for gx in 0..current.width {
                            let old = current.vertex(gx, gy);
                            let px = current.x_min as f64 + gx as f64 * current.pixel_pitch();
                            let py = current.y_min as f64 + gy as f64 * current.pixel_pitch();

                            let mut sum_x = 0.0;
                            let mut sum_y = 0.0;
                            let mut weight = 0.0;
                            for constraint in &constraints {
                                let sampled = (|| -> Option<(f64, f64, f64)> {
                                    match constraint {
                                        Constraint::Forward { reference, local } => {
                                            let (lx, ly, lc) = sample(local, px, py)?;
                                            if lc <= 0.0 {
                                                return None;
                                            }
                                            let target = maps.get(*reference)?;
                                            let (gx_, gy_, gc) = sample(target, lx, ly)?;
                                            Some((gx_, gy_, (lc as f64) * (gc as f64)))
                                        }
                                        Constraint::Reverse { moving, inverse } => {
                                            let (lx, ly, lc) = sample(inverse, px, py)?;
                                            if lc <= 0.0 {
                                                return None;
                                            }
                                            let target = maps.get(*moving)?;
                                            let (gx_, gy_, gc) = sample(target, lx, ly)?;
                                            Some((gx_, gy_, (lc as f64) * (gc as f64)))
                                        }
                                    }
                                })();
                                if let Some((sx, sy, w)) = sampled {
                                    if w > 0.0 {
                                        sum_x += sx * w;
                                        sum_y += sy * w;
                                        weight += w;
                                    }
                                }
                            }

                            if weight > 1e-9 {
                                let target_x = sum_x / weight;
                                let target_y = sum_y / weight;
                                let alpha = config.relaxation_factor;
                                let new_x = old.x as f64 + alpha * (target_x - old.x as f64);
                                let new_y = old.y as f64 + alpha * (target_y - old.y as f64);
                                updated.set_vertex(
                                    gx,
                                    gy,
                                    MapVertex { x: new_x as f32, y: new_y as f32, c: old.c.max(0.1) },
                                );
                            }
                        }
                    }
                    Some((image.clone(), updated))
                })
                .collect();

            for (image, updated) in updates {
                let prev = maps.get(&image);
                if let Some(prev) = prev {
                    for (a, b) in prev.vertices.iter().zip(updated.vertices.iter()) {
                        let d = ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt() as f64;
                        max_delta = max_delta.max(d);
                    }
                }
                maps.insert(image, updated);
            }
        }

        if max_delta < config.convergence_tolerance {
            break;
        }
    }

    Ok(maps)
}

/// Double a level's global maps to seed the next (finer) level: vertex
/// positions and grid spacing both double, mirroring
/// [`crate::correspond`]'s level-to-level doubling.
pub fn upsample(maps: &GlobalMaps, finer_level: usize) -> GlobalMaps {
    let mut out = GlobalMaps::new();
    for (image, map) in maps {
        let mut new_map = Map::new(
            finer_level,
            map.width,
            map.height,
            map.x_min * 2.0,
            map.y_min * 2.0,
            image.clone(),
            map.reference_name.clone(),
        );
        for gy in 0..map.height {
            for gx in 0..map.width {
                let v = map.vertex(gx, gy);
                new_map.set_vertex(gx, gy, MapVertex { x: v.x * 2.0, y: v.y * 2.0, c: v.c });
            }
        }
        out.insert(image.clone(), new_map);
    }
    out
}

/// Run the full multigrid relaxation: identity-seed at the coarsest
/// level in `levels`, relax, then upsample and relax again at each
/// successively finer level. `grid_for_level` supplies the
/// `(grid_w, grid_h, x_min, y_min)` the coarsest level's identity seed
/// should use; finer levels inherit the upsampled grid's own dimensions.
pub fn run_multigrid(
    graphs: &[(usize, AdjacencyGraph)],
    grid_for_coarsest: (usize, usize, f32, f32),
    config: &RelaxConfig,
) -> Result<GlobalMaps> {
    if graphs.is_empty() {
        return Err(AlignError::Degenerate("no levels to relax".into()));
    }
    let mut order: Vec<usize> = (0..graphs.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(graphs[i].0));

    let (gw, gh, x_min, y_min) = grid_for_coarsest;
    let (coarsest_level, coarsest_graph) = &graphs[order[0]];
    let mut maps = seed_identity(coarsest_graph, *coarsest_level, gw, gh, x_min, y_min);
    maps = relax(coarsest_graph, maps, config)?;

    for &idx in &order[1..] {
        let (level, graph) = &graphs[idx];
        maps = upsample(&maps, *level);
        maps = relax(graph, maps, config)?;
    }

    Ok(maps)
}

/// BFS order over `graph.images()` starting from an anchor, exposed for
/// callers that want to validate connectivity before relaxing (a
/// disconnected graph means some image has no path to the anchor and
/// will never be constrained).
pub fn reachable_from_anchor(graph: &AdjacencyGraph) -> Vec<String> {
    let images = graph.images();
    let Some(anchor) = images.first() else {
        return Vec::new();
    };
    let mut seen = vec![anchor.clone()];
    let mut queue = VecDeque::new();
    queue.push_back(anchor.clone());
    while let Some(cur) = queue.pop_front() {
        for n in graph.neighbors(&cur) {
            if !seen.iter().any(|s| s == n) {
                seen.push(n.to_string());
                queue.push_back(n.to_string());
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair::{OverlapRegion, Pair};

    fn overlap() -> OverlapRegion {
        OverlapRegion { x: 0.0, y: 0.0, width: 64.0, height: 64.0 }
    }

    fn translation_map(level: usize, w: usize, h: usize, dx: f32, dy: f32, moving: &str, reference: &str) -> Map {
        let mut map = Map::new(level, w, h, 0.0, 0.0, moving, reference);
        let pitch = (1u64 << level) as f32;
        for gy in 0..h {
            for gx in 0..w {
                map.set_vertex(
                    gx,
                    gy,
                    MapVertex { x: gx as f32 * pitch + dx, y: gy as f32 * pitch + dy, c: 1.0 },
                );
            }
        }
        map
    }

    #[test]
    fn two_image_chain_propagates_translation() {
        let mut graph = AdjacencyGraph::new();
        graph.add_pair(Pair::new("b", "a", overlap(), vec![4]));
        graph.set_map("b", "a", translation_map(0, 4, 4, 10.0, 5.0, "b", "a")).unwrap();

        let maps = seed_identity(&graph, 0, 4, 4, 0.0, 0.0);
        let config = RelaxConfig { max_iterations: 50, relaxation_factor: 1.0, ..RelaxConfig::default() };
        let solved = relax(&graph, maps, &config).unwrap();

        let b = &solved["b"];
        for gy in 0..4 {
            for gx in 0..4 {
                let v = b.vertex(gx, gy);
                let expected_x = gx as f32 + 10.0;
                let expected_y = gy as f32 + 5.0;
                assert!((v.x - expected_x).abs() < 0.5, "gx={gx} gy={gy} got {} want {}", v.x, expected_x);
                assert!((v.y - expected_y).abs() < 0.5, "gx={gx} gy={gy} got {} want {}", v.y, expected_y);
            }
        }
    }

    #[test]
    fn reachable_from_anchor_finds_connected_chain() {
        let mut graph = AdjacencyGraph::new();
        graph.add_pair(Pair::new("b", "a", overlap(), vec![4]));
        graph.add_pair(Pair::new("c", "b", overlap(), vec![4]));
        let reached = reachable_from_anchor(&graph);
        assert_eq!(reached.len(), 3);
    }

    #[test]
    fn disconnected_image_is_not_reachable() {
        let mut graph = AdjacencyGraph::new();
        graph.add_pair(Pair::new("b", "a", overlap(), vec![4]));
        graph.add_image("orphan");
        let reached = reachable_from_anchor(&graph);
        assert!(!reached.iter().any(|s| s == "orphan"));
    }
}
