//! On-disk pipeline/solver configuration (AMBIENT, SPEC_FULL §2): a single
//! TOML document naming the image set, the pair list with each pair's
//! expected overlap and search-radius schedule, and the per-component
//! solver tunables: one `serde`-derived struct loaded with `toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::correspond::CorrelationConfig;
use crate::error::{AlignError, Result};
use crate::localmap::LocalMapConfig;
use crate::pair::{AdjacencyGraph, OverlapRegion, Pair};
use crate::relax::RelaxConfig;

/// One image's source path and optional companion mask, keyed by the
/// `imageName` used everywhere else (map headers, cache keys, pair
/// records).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageSpec {
    pub name: String,
    pub path: PathBuf,
    /// A PBM/PBM.gz validity mask; when absent, every pixel is valid.
    #[serde(default)]
    pub mask_path: Option<PathBuf>,
}

/// One pair's configuration, as it would appear in a TOML `[[pairs]]`
/// table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairSpec {
    pub moving: String,
    pub reference: String,
    pub overlap_x: f32,
    pub overlap_y: f32,
    pub overlap_width: f32,
    pub overlap_height: f32,
    /// Search radius in pixels, indexed by pyramid level (coarsest last
    /// or first is the caller's choice; only non-increasing coarse->fine
    /// is validated, see [`Pair::validate_radius_schedule`]).
    pub radius_schedule: Vec<usize>,
}

impl PairSpec {
    pub fn to_pair(&self) -> Pair {
        Pair::new(
            self.moving.clone(),
            self.reference.clone(),
            OverlapRegion {
                x: self.overlap_x,
                y: self.overlap_y,
                width: self.overlap_width,
                height: self.overlap_height,
            },
            self.radius_schedule.clone(),
        )
    }
}

/// The full top-level configuration document for one alignment run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlignConfig {
    pub images: Vec<ImageSpec>,
    pub pairs: Vec<PairSpec>,

    /// Coarsest pyramid level the correspondence engine starts from.
    #[serde(default = "default_max_level")]
    pub max_level: usize,
    /// Finest (output) level the per-pair maps and the final relaxation
    /// are produced at.
    #[serde(default)]
    pub target_level: usize,

    /// Directory for shared pyramid/DT disk caches (§3 "Lifecycles").
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Directory per-pair and final maps are written under.
    pub output_dir: PathBuf,
    /// In-memory pyramid cache budget, in bytes.
    #[serde(default = "default_cache_budget")]
    pub cache_budget_bytes: usize,

    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub local_map: LocalMapConfig,
    #[serde(default)]
    pub relax: RelaxConfig,
}

fn default_max_level() -> usize {
    crate::consts::DEFAULT_PYRAMID_MAX_LEVEL
}

fn default_cache_budget() -> usize {
    crate::consts::DEFAULT_CACHE_BUDGET_BYTES
}

impl AlignConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AlignError::InputMissing(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| AlignError::FormatError(format!("config parse error: {e}")))
    }

    pub fn image(&self, name: &str) -> Option<&ImageSpec> {
        self.images.iter().find(|i| i.name == name)
    }

    /// Build the [`AdjacencyGraph`] implied by `pairs`, with every
    /// configured image present even if some have no pair touching them
    /// yet.
    pub fn adjacency_graph(&self) -> AdjacencyGraph {
        let mut graph = AdjacencyGraph::new();
        for image in &self.images {
            graph.add_image(image.name.clone());
        }
        for pair in &self.pairs {
            graph.add_pair(pair.to_pair());
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let config = AlignConfig {
            images: vec![
                ImageSpec { name: "a".into(), path: "a.tif".into(), mask_path: None },
                ImageSpec { name: "b".into(), path: "b.tif".into(), mask_path: Some("b.pbm".into()) },
            ],
            pairs: vec![PairSpec {
                moving: "a".into(),
                reference: "b".into(),
                overlap_x: 0.0,
                overlap_y: 0.0,
                overlap_width: 100.0,
                overlap_height: 100.0,
                radius_schedule: vec![16, 8, 4],
            }],
            max_level: 4,
            target_level: 0,
            cache_dir: None,
            output_dir: "out".into(),
            cache_budget_bytes: default_cache_budget(),
            correlation: CorrelationConfig::default(),
            local_map: LocalMapConfig::default(),
            relax: RelaxConfig::default(),
        };

        let text = toml::to_string(&config).unwrap();
        let back: AlignConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.images.len(), 2);
        assert_eq!(back.pairs[0].radius_schedule, vec![16, 8, 4]);
    }

    #[test]
    fn adjacency_graph_includes_unpaired_images() {
        let config = AlignConfig {
            images: vec![
                ImageSpec { name: "a".into(), path: "a.tif".into(), mask_path: None },
                ImageSpec { name: "isolated".into(), path: "c.tif".into(), mask_path: None },
            ],
            pairs: vec![],
            max_level: 4,
            target_level: 0,
            cache_dir: None,
            output_dir: "out".into(),
            cache_budget_bytes: default_cache_budget(),
            correlation: CorrelationConfig::default(),
            local_map: LocalMapConfig::default(),
            relax: RelaxConfig::default(),
        };
        let graph = config.adjacency_graph();
        assert!(graph.images().iter().any(|i| i == "isolated"));
    }
}
