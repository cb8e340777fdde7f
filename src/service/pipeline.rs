//! Forward and inverse chains built once from the configured canonical space

use crate::config::GeometryConfig;
use crate::transforms::{
    ArrayToGrid, CastToFloat32, CropOrPadToSize, DecodeVolumeFile, GridToArray, IntensityRescale,
    RescaleIntensity, ResampleToOriginalResolution, ResampleToResolution, RestoreOriginalSize,
    StackBatch, TransformChain, UnstackBatch,
};

/// Scratch-file path in the caller's geometry to a `(1, z, y, x, 1)` batch
/// in the model's.
pub fn forward_chain(
    image_field: &str,
    geometry: &GeometryConfig,
    intensity: IntensityRescale,
) -> TransformChain {
    TransformChain::new(vec![
        Box::new(DecodeVolumeFile::new(image_field).with_max_voxels(geometry.max_voxels)),
        Box::new(CastToFloat32::new(image_field)),
        Box::new(RescaleIntensity::new(image_field, intensity)),
        Box::new(
            ResampleToResolution::new(image_field, geometry.volume_resolution)
                .with_max_voxels(geometry.max_voxels),
        ),
        Box::new(GridToArray::new(image_field)),
        Box::new(CropOrPadToSize::new(image_field, geometry.volume_size)),
        Box::new(StackBatch::new(image_field)),
    ])
}

/// Label batch back to a grid in the caller's geometry.
///
/// Mirrors only the geometric suffix of [`forward_chain`]: labels are never
/// intensity-rescaled back and there is no file to re-encode into.
pub fn inverse_chain(segmentation_field: &str, image_field: &str) -> TransformChain {
    TransformChain::new(vec![
        Box::new(UnstackBatch::new(segmentation_field)),
        Box::new(RestoreOriginalSize::new(segmentation_field, image_field)),
        Box::new(ArrayToGrid::new(segmentation_field, image_field)),
        Box::new(ResampleToOriginalResolution::new(segmentation_field, image_field)),
    ])
}
