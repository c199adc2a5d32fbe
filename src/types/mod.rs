//! Domain types for build artifacts.

pub mod image;

pub use image::{
    ImageCell, ImageDetails, ImageKind, ImageStatus, PersistentImage, SharedImage, StatusDetail,
};
