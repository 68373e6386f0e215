use tracing_subscriber::EnvFilter;

/// Install the process-wide `tracing` subscriber, gated by `--verbose`:
/// `debug` when verbose, `warn` otherwise.
pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load a raster image plus its companion validity mask (or an
/// all-valid mask, if none was given) from disk.
pub fn load_image_and_mask(
    image_path: &std::path::Path,
    mask_path: Option<&std::path::Path>,
) -> anyhow::Result<(aligntk_core::raster::GrayImage, aligntk_core::raster::Bitmap)> {
    let image = aligntk_core::raster::GrayImage::read(image_path)?;
    let mask = match mask_path {
        Some(path) => aligntk_core::raster::Bitmap::read(path)?,
        None => aligntk_core::raster::Bitmap::all_valid(image.width, image.height),
    };
    Ok((image, mask))
}
