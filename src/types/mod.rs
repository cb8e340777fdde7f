//! Type definitions for the segmentation service

pub mod envelope;
pub mod record;
pub mod volume;

pub use envelope::{CapabilityManifest, ElementKind, Envelope, ResponseElement, Widget};
pub use record::{Record, Value};
pub use volume::{Geometry, PixelType, Volume, VoxelBuffer, DEFAULT_MAX_VOXELS};
