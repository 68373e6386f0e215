/// Minimum pixel count (h*w) to use row-level Rayon parallelism.
pub const PARALLEL_PIXEL_THRESHOLD: usize = 65_536;

/// Minimum grid-cell count to use cell-level Rayon parallelism in the
/// correspondence engine and relaxation sweeps.
pub const PARALLEL_CELL_THRESHOLD: usize = 16;

/// Small epsilon to avoid division by zero in floating-point comparisons
/// (patch stdev check, 4.C step 3).
pub const EPSILON: f32 = 1e-10;

/// Default in-memory pyramid/DT cache budget (bytes) if not configured.
pub const DEFAULT_CACHE_BUDGET_BYTES: usize = 512 * 1024 * 1024;

/// Huber loss transition parameter (in pixels) for the IRLS affine/rigid
/// fit in the local-map solver (4.D step 1).
pub const DEFAULT_HUBER_DELTA: f64 = 2.0;

/// Default smoothness weight `lambda` for the biharmonic residual
/// interpolation (4.D step 3).
pub const DEFAULT_SMOOTHNESS_LAMBDA: f64 = 0.1;

/// Default Gauss-Seidel / conjugate-gradient iteration cap for the
/// biharmonic solve and the relaxation sweeps, to turn non-convergence
/// into `AlignError::Convergence` rather than an infinite loop.
pub const DEFAULT_MAX_ITERATIONS: usize = 500;

/// Default coarsest pyramid level the correspondence engine starts from
/// when a config document doesn't say otherwise.
pub const DEFAULT_PYRAMID_MAX_LEVEL: usize = 5;
