//! `register`: registers one (moving, reference) pair — builds pyramids
//! for both images, computes the reference's distance transforms, runs
//! the correspondence engine from `--max-level` down to `--target-level`,
//! fits a local map, and writes it out (§4.C, §4.D, §6 "CLI surface").

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use aligntk_cli::common::{init_tracing, load_image_and_mask};
use aligntk_core::compute::CpuFft;
use aligntk_core::consts::DEFAULT_PYRAMID_MAX_LEVEL;
use aligntk_core::correspond::{run_correspondence, CorrelationConfig};
use aligntk_core::dt::distance_transform;
use aligntk_core::error::AlignError;
use aligntk_core::localmap::{solve_local_map, LocalMapConfig};
use aligntk_core::pyramid::build_pyramid;

/// Register a pair of images, producing a dense deformation map.
#[derive(Parser)]
#[command(name = "register", version, about)]
struct Args {
    /// Name recorded in the output map's `imageName` field.
    #[arg(long)]
    moving_name: String,
    /// Name recorded in the output map's `referenceName` field.
    #[arg(long)]
    reference_name: String,

    /// Path to the moving image.
    #[arg(long)]
    moving_image: PathBuf,
    /// Path to the reference image.
    #[arg(long)]
    reference_image: PathBuf,
    /// Optional PBM/PBM.gz validity mask for the moving image.
    #[arg(long)]
    moving_mask: Option<PathBuf>,
    /// Optional PBM/PBM.gz validity mask for the reference image.
    #[arg(long)]
    reference_mask: Option<PathBuf>,

    /// Where to write the resulting "M1" map file.
    #[arg(long)]
    output: PathBuf,

    /// Coarsest pyramid level the correspondence engine starts from.
    #[arg(long, default_value_t = DEFAULT_PYRAMID_MAX_LEVEL)]
    max_level: usize,
    /// Finest level the output map is produced at.
    #[arg(long, default_value_t = 0)]
    target_level: usize,
    /// Comma-separated search radius per level, coarsest first (reused
    /// for any level beyond the list's length).
    #[arg(long, default_value = "32,16,8,4,2,1")]
    radius_schedule: String,

    #[arg(long, default_value_t = CorrelationConfig::default().patch_size)]
    patch_size: usize,
    #[arg(long, default_value_t = CorrelationConfig::default().grid_stride)]
    grid_stride: usize,
    #[arg(long, default_value_t = CorrelationConfig::default().min_corr)]
    min_corr: f64,
    #[arg(long, default_value_t = CorrelationConfig::default().min_ratio)]
    min_ratio: f64,
    #[arg(long, default_value_t = CorrelationConfig::default().dt_min)]
    dt_min: f64,
    #[arg(long, default_value_t = CorrelationConfig::default().valid_fraction)]
    valid_fraction: f64,
    #[arg(long, default_value_t = CorrelationConfig::default().min_accept)]
    min_accept: f64,

    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> Result<(), AlignError> {
    let (moving_img, moving_mask) =
        load_image_and_mask(&args.moving_image, args.moving_mask.as_deref())
            .map_err(|e| AlignError::InputMissing(e.to_string()))?;
    let (reference_img, reference_mask) =
        load_image_and_mask(&args.reference_image, args.reference_mask.as_deref())
            .map_err(|e| AlignError::InputMissing(e.to_string()))?;

    let radius_schedule: Vec<usize> = args
        .radius_schedule
        .split(',')
        .map(|s| s.trim().parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|e| AlignError::FormatError(format!("bad --radius-schedule: {e}")))?;

    let moving_pyr = build_pyramid(moving_img, moving_mask, args.max_level);
    let reference_pyr = build_pyramid(reference_img, reference_mask, args.max_level);
    let reference_dts: Vec<_> = reference_pyr.iter().map(|l| distance_transform(&l.mask)).collect();

    let config = CorrelationConfig {
        patch_size: args.patch_size,
        grid_stride: args.grid_stride,
        min_corr: args.min_corr,
        min_ratio: args.min_ratio,
        dt_min: args.dt_min,
        valid_fraction: args.valid_fraction,
        min_accept: args.min_accept,
    };
    let fft = CpuFft;

    let field = run_correspondence(
        &moving_pyr,
        &reference_pyr,
        &reference_dts,
        args.target_level,
        &radius_schedule,
        &config,
        &fft,
    )?;

    let map = solve_local_map(
        &field,
        args.moving_name.clone(),
        args.reference_name.clone(),
        &LocalMapConfig::default(),
    )?;

    map.write(&args.output)?;
    tracing::info!(
        moving = %args.moving_name,
        reference = %args.reference_name,
        output = %args.output.display(),
        "pair registered"
    );
    Ok(())
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
