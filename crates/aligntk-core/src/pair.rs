//! Pair records and the adjacency graph over the set of images to align
//! (§3 "Pair record", "Adjacency graph").

use crate::error::{AlignError, Result};
use crate::map::Map;

/// Expected overlap region between a pair's moving and reference image,
/// in reference-frame level-0 pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OverlapRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// An ordered `(moving, reference)` pair plus its expected overlap and
/// per-level search-radius schedule.
#[derive(Clone, Debug)]
pub struct Pair {
    pub moving: String,
    pub reference: String,
    pub overlap: OverlapRegion,
    /// Search radius (in pixels at that level) indexed by pyramid level;
    /// `radius_schedule[0]` is level 0 (finest).
    pub radius_schedule: Vec<usize>,
}

impl Pair {
    pub fn new(
        moving: impl Into<String>,
        reference: impl Into<String>,
        overlap: OverlapRegion,
        radius_schedule: Vec<usize>,
    ) -> Self {
        Self {
            moving: moving.into(),
            reference: reference.into(),
            overlap,
            radius_schedule,
        }
    }

    pub fn radius_at(&self, level: usize) -> usize {
        self.radius_schedule
            .get(level)
            .copied()
            .unwrap_or_else(|| self.radius_schedule.last().copied().unwrap_or(0))
    }

    /// The search radius schedule must be monotonically non-increasing
    /// from coarse to fine (§4.C): walking from the coarsest configured
    /// level down to level 0, the radius never grows.
    pub fn validate_radius_schedule(&self) -> Result<()> {
        for w in self.radius_schedule.windows(2).rev() {
            let (finer, coarser) = (w[0], w[1]);
            if finer > coarser {
                return Err(AlignError::FormatError(format!(
                    "search radius schedule must be non-increasing coarse->fine, got {:?}",
                    self.radius_schedule
                )));
            }
        }
        Ok(())
    }
}

struct Edge {
    pair: Pair,
    map: Option<Map>,
}

/// Undirected multigraph over images; each edge carries one [`Pair`] and,
/// once computed, its dense [`Map`]. Missing edges mean "no constraint"
/// to the relaxation solver.
#[derive(Default)]
pub struct AdjacencyGraph {
    images: Vec<String>,
    edges: Vec<Edge>,
}

impl AdjacencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.images.iter().any(|i| i == &name) {
            self.images.push(name);
        }
    }

    pub fn add_pair(&mut self, pair: Pair) {
        self.add_image(pair.moving.clone());
        self.add_image(pair.reference.clone());
        self.edges.push(Edge { pair, map: None });
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }

    pub fn pairs(&self) -> impl Iterator<Item = &Pair> {
        self.edges.iter().map(|e| &e.pair)
    }

    /// All pairs touching `image`, either as moving or as reference.
    pub fn pairs_touching<'a>(&'a self, image: &'a str) -> impl Iterator<Item = &'a Pair> + 'a {
        self.edges
            .iter()
            .map(|e| &e.pair)
            .filter(move |p| p.moving == image || p.reference == image)
    }

    pub fn neighbors(&self, image: &str) -> Vec<&str> {
        self.pairs_touching(image)
            .map(|p| {
                if p.moving == image {
                    p.reference.as_str()
                } else {
                    p.moving.as_str()
                }
            })
            .collect()
    }

    pub fn set_map(&mut self, moving: &str, reference: &str, map: Map) -> Result<()> {
        let edge = self
            .edges
            .iter_mut()
            .find(|e| e.pair.moving == moving && e.pair.reference == reference)
            .ok_or_else(|| {
                AlignError::FormatError(format!("no such pair edge {moving} -> {reference}"))
            })?;
        edge.map = Some(map);
        Ok(())
    }

    pub fn map_for(&self, moving: &str, reference: &str) -> Option<&Map> {
        self.edges
            .iter()
            .find(|e| e.pair.moving == moving && e.pair.reference == reference)
            .and_then(|e| e.map.as_ref())
    }

    /// A red-black (2-)coloring of the image adjacency graph, used by the
    /// relaxation solver (4.E/§5) so that concurrently updated images
    /// within one color class never share an edge. Uses a simple greedy
    /// BFS 2-coloring; falls back to more colors only if the graph is
    /// non-bipartite (the relaxation loop then runs one sweep per color).
    pub fn color_classes(&self) -> Vec<Vec<String>> {
        use std::collections::{HashMap, VecDeque};

        let mut color: HashMap<&str, usize> = HashMap::new();
        let mut max_color = 0usize;

        for start in &self.images {
            if color.contains_key(start.as_str()) {
                continue;
            }
            color.insert(start.as_str(), 0);
            let mut queue = VecDeque::new();
            queue.push_back(start.as_str());
            while let Some(cur) = queue.pop_front() {
                let cur_color = color[cur];
                for n in self.neighbors(cur) {
                    match color.get(n) {
                        None => {
                            let assigned = if cur_color % 2 == 0 { 1 } else { 0 };
                            color.insert(n, assigned);
                            max_color = max_color.max(assigned);
                            queue.push_back(n);
                        }
                        Some(&c) if c == cur_color => {
                            // Odd cycle: bump to a fresh color class rather
                            // than mis-coloring (keeps the "no shared edge
                            // within a class" guarantee at the cost of more
                            // sequential classes on non-bipartite graphs).
                            max_color += 1;
                            color.insert(n, max_color);
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        let mut classes: Vec<Vec<String>> = vec![Vec::new(); max_color + 1];
        for image in &self.images {
            let c = color.get(image.as_str()).copied().unwrap_or(0);
            classes[c].push(image.clone());
        }
        classes.retain(|c| !c.is_empty());
        classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlap() -> OverlapRegion {
        OverlapRegion { x: 0.0, y: 0.0, width: 100.0, height: 100.0 }
    }

    #[test]
    fn color_classes_avoid_shared_edges() {
        let mut g = AdjacencyGraph::new();
        g.add_pair(Pair::new("a", "b", overlap(), vec![4, 2, 1]));
        g.add_pair(Pair::new("b", "c", overlap(), vec![4, 2, 1]));
        g.add_pair(Pair::new("c", "d", overlap(), vec![4, 2, 1]));
        g.add_pair(Pair::new("d", "a", overlap(), vec![4, 2, 1]));

        let classes = g.color_classes();
        for class in &classes {
            for i in class {
                for j in class {
                    if i != j {
                        assert!(!g.neighbors(i).contains(&j.as_str()));
                    }
                }
            }
        }
    }

    #[test]
    fn radius_schedule_validation() {
        let good = Pair::new("a", "b", overlap(), vec![4, 4, 2, 1]);
        assert!(good.validate_radius_schedule().is_ok());
        let bad = Pair::new("a", "b", overlap(), vec![4, 8, 2, 1]);
        assert!(bad.validate_radius_schedule().is_err());
    }
}
