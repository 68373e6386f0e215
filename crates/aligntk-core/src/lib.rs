pub mod consts;
pub mod error;
pub mod raster;
pub mod pyramid;
pub mod dt;
pub mod compute;
pub mod map;
pub mod pair;
pub mod subpixel;
pub mod correspond;
pub mod localmap;
pub mod relax;
pub mod config;
