//! `mapinfo`: inspect an "M1" map file and print its header plus a
//! confidence-distribution summary (§6 "CLI surface", §6 "Map file
//! format").

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use console::style;

use aligntk_core::error::AlignError;
use aligntk_core::map::Map;

#[derive(Parser)]
#[command(name = "mapinfo", version, about)]
struct Args {
    /// Path to the "M1" map file to inspect.
    map: PathBuf,
}

fn run(args: &Args) -> Result<(), AlignError> {
    let map = Map::read(&args.map)?;

    println!("{} {}", style("image:").bold(), map.image_name);
    println!("{} {}", style("reference:").bold(), map.reference_name);
    println!("{} {}", style("level:").bold(), map.level);
    println!(
        "{} {} x {} (pitch {} px)",
        style("grid:").bold(),
        map.width,
        map.height,
        map.pixel_pitch()
    );
    println!("{} ({}, {})", style("origin:").bold(), map.x_min, map.y_min);

    let total = map.vertices.len();
    let accepted = map.vertices.iter().filter(|v| v.c > 0.0).count();
    let mean_c = if total > 0 {
        map.vertices.iter().map(|v| v.c as f64).sum::<f64>() / total as f64
    } else {
        0.0
    };
    let min_c = map.vertices.iter().map(|v| v.c).fold(f32::INFINITY, f32::min);
    let max_c = map.vertices.iter().map(|v| v.c).fold(f32::NEG_INFINITY, f32::max);

    println!();
    println!(
        "{} {}/{} vertices with c>0 ({:.1}%)",
        style("accepted:").bold(),
        accepted,
        total,
        if total > 0 { accepted as f64 / total as f64 * 100.0 } else { 0.0 }
    );
    println!("{} mean={:.3} min={:.3} max={:.3}", style("confidence:").bold(), mean_c, min_c, max_c);

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

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
