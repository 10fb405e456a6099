//! A memory-safe, pure-Rust JPEG 2000 codec.
//!
//! The crate implements the tile-based wavelet coding pipeline of
//! ISO/IEC 15444-1 raw codestreams in both directions: [`decode`]
//! reconstructs an [`Image`] from codestream bytes, optionally
//! restricted to a canvas region decoded through sparse buffers, and
//! [`encode`] produces a codestream from an image. The JP2 container
//! (file boxes) and host raster formats are outside its scope; inputs
//! and outputs are raw codestreams and plain sample planes.

#![forbid(unsafe_code)]

mod bit_io;
mod bitplane;
mod byte_io;
mod cache;
mod codestream;
mod decode;
mod dwt;
mod encode;
pub mod error;
mod image;
pub(crate) mod log;
mod math;
mod mct;
mod mq;
mod packet;
mod plane;
mod progression;
mod quant;
mod rect;
mod sparse;
pub mod stream;
mod tag_tree;
mod tile;
mod tile_component;
mod window;

pub use cache::TileCacheStrategy;
pub use codestream::{ProgressionOrder, WaveletTransform};
pub use decode::{DecodeSettings, decode, decode_source};
pub use encode::{EncodeSettings, encode};
pub use error::{Error, Result};
pub use image::{ColorSpace, Image, ImageComponent};
pub use rect::Rect;
