#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

mod error;
mod factory;
mod format;
mod geom;
mod image;
mod link;
mod segment;
mod surface;

pub use error::*;
pub use factory::*;
pub use format::*;
pub use geom::*;
pub use image::*;
pub use link::*;
pub use segment::*;
pub use surface::*;
