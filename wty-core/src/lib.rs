//! Codec for Allwinner IMAGEWTY firmware containers.
//!
//! [`extract::extract`] turns an image into a dump directory (payload files
//! plus `image.cfg`); [`repack::repack`] rebuilds an image from one, with
//! offsets and padding recomputed from the files on disk.
//!
//! Operations on a given image or dump directory assume a single caller;
//! concurrent extract and repack of the same directory is not detected.

pub mod checksum;
pub mod error;
pub mod extract;
pub mod header;
pub mod manifest;
pub mod path_safety;
pub mod repack;

pub use error::{Result, WtyError};
pub use extract::{extract, open_image, ExtractOptions, ExtractReport};
pub use header::{FileEntry, ImageHeader};
pub use manifest::{Manifest, ManifestStrictness};
pub use repack::{repack, RepackOptions, RepackReport};
