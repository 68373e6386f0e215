//! `align`: the single-process batch driver. Reads an [`AlignConfig`]
//! TOML document naming an image set and a pair list, registers every
//! pair (§4.A-§4.D), then runs one level of global relaxation (§4.E)
//! over the resulting adjacency graph and writes one final map per
//! image.
//!
//! `prun` is the distributed equivalent: it fans the same per-pair
//! registrations out across a cluster as work units, then runs this
//! binary's relaxation step once every pair map exists.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use aligntk_cli::common::init_tracing;
use aligntk_core::compute::CpuFft;
use aligntk_core::config::AlignConfig;
use aligntk_core::correspond::run_correspondence;
use aligntk_core::dt::DtStore;
use aligntk_core::error::{AlignError, Result};
use aligntk_core::localmap::solve_local_map;
use aligntk_core::pyramid::PyramidStore;
use aligntk_core::raster::{Bitmap, GrayImage};
use aligntk_core::relax::run_multigrid;

#[derive(Parser)]
#[command(name = "align", version, about)]
struct Args {
    /// Path to the run's TOML configuration document.
    #[arg(long)]
    config: PathBuf,
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> Result<()> {
    let config = AlignConfig::load(&args.config)?;
    std::fs::create_dir_all(&config.output_dir)?;

    let pyramids = PyramidStore::new(config.cache_dir.clone(), config.cache_budget_bytes);
    let dts = DtStore::new(config.cache_dir.clone());
    let fft = CpuFft;

    let mut graph = config.adjacency_graph();

    let pb = ProgressBar::new(config.pairs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("Registering [{bar:40}] {pos}/{len}")
            .expect("static progress template is valid")
            .progress_chars("=> "),
    );

    for pair_spec in &config.pairs {
        let pair = pair_spec.to_pair();
        pair.validate_radius_schedule()?;

        let moving_spec = config
            .image(&pair.moving)
            .ok_or_else(|| AlignError::InputMissing(format!("no image entry for {}", pair.moving)))?;
        let reference_spec = config
            .image(&pair.reference)
            .ok_or_else(|| AlignError::InputMissing(format!("no image entry for {}", pair.reference)))?;

        let moving_pyr = (0..=config.max_level)
            .map(|level| {
                pyramids
                    .get_level(&pair.moving, level, &load_source(moving_spec))
                    .map(|arc| (*arc).clone())
            })
            .collect::<Result<Vec<_>>>()?;
        let reference_pyr = (0..=config.max_level)
            .map(|level| {
                pyramids
                    .get_level(&pair.reference, level, &load_source(reference_spec))
                    .map(|arc| (*arc).clone())
            })
            .collect::<Result<Vec<_>>>()?;

        let reference_dts = reference_pyr
            .iter()
            .enumerate()
            .map(|(level, lvl)| dts.get(&pair.reference, level, &lvl.mask).map(|arc| (*arc).clone()))
            .collect::<Result<Vec<_>>>()?;

        let field = run_correspondence(
            &moving_pyr,
            &reference_pyr,
            &reference_dts,
            config.target_level,
            &pair.radius_schedule,
            &config.correlation,
            &fft,
        )?;

        let pair_map = solve_local_map(&field, pair.moving.clone(), pair.reference.clone(), &config.local_map)?;

        let pair_path = config.output_dir.join(format!("{}_{}.map", pair.moving, pair.reference));
        pair_map.write(&pair_path)?;
        info!(moving = %pair.moving, reference = %pair.reference, "pair registered");

        graph.set_map(&pair.moving, &pair.reference, pair_map)?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    let anchor_spec = config
        .images
        .first()
        .ok_or_else(|| AlignError::Degenerate("configuration has no images".into()))?;
    let anchor_level = pyramids.get_level(&anchor_spec.name, config.target_level, &load_source(anchor_spec))?;

    let final_maps = run_multigrid(
        &[(config.target_level, graph)],
        (anchor_level.image.width, anchor_level.image.height, 0.0, 0.0),
        &config.relax,
    )?;

    for (image, map) in &final_maps {
        let path = config.output_dir.join(format!("{image}.final.map"));
        map.write(&path)?;
        info!(image = %image, output = %path.display(), "final map written");
    }

    Ok(())
}

fn load_source(
    spec: &aligntk_core::config::ImageSpec,
) -> impl Fn() -> Result<(GrayImage, Bitmap)> + '_ {
    move || {
        let image = GrayImage::read(&spec.path)?;
        let mask = match &spec.mask_path {
            Some(path) => Bitmap::read(path)?,
            None => Bitmap::all_valid(image.width, image.height),
        };
        Ok((image, mask))
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::from(0),
        Err(e @ AlignError::Io(_)) => {
            eprintln!("{e}");
            ExitCode::from(3)
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(1)
        }
    }
}
