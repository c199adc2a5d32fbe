//! Forge Core Library
//!
//! Orchestration core for a cloud image building service: entities move
//! through base, target and provider build stages driven by pluggable OS
//! and cloud delegates, with webhook delivery and persistent storage.

pub mod builder;
pub mod callbacks;
pub mod config;
pub mod context;
pub mod delegates;
pub mod error;
pub mod events;
pub mod plugins;
pub mod reservations;
pub mod storage;
pub mod types;

// Re-export commonly used items
pub use builder::{
    BaseSource, BuildDispatcher, BuildHandle, Builder, OsSelector, Stage, TargetSource,
};
pub use config::Config;
pub use context::AppContext;
pub use error::{ForgeError, Result};
pub use types::{
    ImageCell, ImageDetails, ImageKind, ImageStatus, PersistentImage, SharedImage, StatusDetail,
};
