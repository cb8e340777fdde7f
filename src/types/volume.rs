//! In-memory volumetric grid: voxel buffer plus spatial metadata

use crate::error::{ServiceError, ServiceResult};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Row-major 3x3 identity direction cosine matrix
pub const IDENTITY_DIRECTION: [f64; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// Largest grid decoded or resampled for a single request (1 GiB of `f32`)
pub const DEFAULT_MAX_VOXELS: usize = 1 << 28;

/// Spatial placement of a voxel grid.
///
/// `size`, `spacing` and `origin` are ordered `[x, y, z]`; `direction` is the
/// row-major direction cosine matrix whose columns are the grid axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub size: [usize; 3],
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    pub direction: [f64; 9],
}

impl Geometry {
    /// Axis-aligned geometry anchored at the origin
    pub fn new(size: [usize; 3], spacing: [f64; 3]) -> Self {
        Self {
            size,
            spacing,
            origin: [0.0; 3],
            direction: IDENTITY_DIRECTION,
        }
    }

    pub fn voxel_count(&self) -> usize {
        self.size.iter().product()
    }

    /// Voxel count, or `None` when it does not fit in `usize`
    pub fn checked_voxel_count(&self) -> Option<usize> {
        self.size
            .iter()
            .try_fold(1usize, |count, &n| count.checked_mul(n))
    }

    /// Every spacing finite and strictly positive
    pub fn has_valid_spacing(&self) -> bool {
        self.spacing.iter().all(|s| s.is_finite() && *s > 0.0)
    }

    /// Origin and direction free of NaN and infinities
    pub fn is_finite(&self) -> bool {
        self.origin.iter().chain(self.direction.iter()).all(|v| v.is_finite())
    }

    /// Shape of the voxel array, `(z, y, x)`
    pub fn array_shape(&self) -> (usize, usize, usize) {
        (self.size[2], self.size[1], self.size[0])
    }

    /// Geometry covering the same physical extent at a different spacing.
    ///
    /// Sizes are rounded up so the resampled grid reaches the last voxel
    /// centre of the original one. An extent too large for `usize` saturates,
    /// so callers bound the result with [`Geometry::checked_voxel_count`].
    pub fn with_spacing(&self, spacing: [f64; 3]) -> Self {
        let mut size = [0usize; 3];
        for axis in 0..3 {
            let extent = self.size[axis] as f64 * self.spacing[axis] / spacing[axis];
            // Guard against 85.0000000001 turning into 86
            size[axis] = ((extent - 1e-6).ceil() as usize).max(1);
        }
        Self {
            size,
            spacing,
            origin: self.origin,
            direction: self.direction,
        }
    }

    /// Physical coordinates of a (continuous) voxel index `[x, y, z]`
    pub fn index_to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        let d = &self.direction;
        let scaled = [
            index[0] * self.spacing[0],
            index[1] * self.spacing[1],
            index[2] * self.spacing[2],
        ];
        let mut point = self.origin;
        for (row, p) in point.iter_mut().enumerate() {
            *p += d[row * 3] * scaled[0] + d[row * 3 + 1] * scaled[1] + d[row * 3 + 2] * scaled[2];
        }
        point
    }

    /// Continuous voxel index `[x, y, z]` of a physical point.
    ///
    /// Assumes an orthonormal direction matrix, so its inverse is the transpose.
    pub fn physical_to_index(&self, point: [f64; 3]) -> [f64; 3] {
        let d = &self.direction;
        let rel = [
            point[0] - self.origin[0],
            point[1] - self.origin[1],
            point[2] - self.origin[2],
        ];
        let mut index = [0.0; 3];
        for (col, idx) in index.iter_mut().enumerate() {
            let projected = d[col] * rel[0] + d[3 + col] * rel[1] + d[6 + col] * rel[2];
            *idx = projected / self.spacing[col];
        }
        index
    }

    /// True when both grids have the same voxel lattice within `tolerance`
    pub fn is_congruent(&self, other: &Geometry, tolerance: f64) -> bool {
        let close = |a: &[f64], b: &[f64]| a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tolerance);
        self.size == other.size
            && close(&self.spacing, &other.spacing)
            && close(&self.origin, &other.origin)
            && close(&self.direction, &other.direction)
    }
}

/// Voxel storage type, named after the MetaImage element types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl PixelType {
    pub fn byte_width(self) -> usize {
        match self {
            PixelType::UInt8 | PixelType::Int8 => 1,
            PixelType::UInt16 | PixelType::Int16 => 2,
            PixelType::UInt32 | PixelType::Int32 | PixelType::Float32 => 4,
            PixelType::Float64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, PixelType::Float32 | PixelType::Float64)
    }
}

/// Typed voxel array indexed `[z, y, x]`
#[derive(Debug, Clone, PartialEq)]
pub enum VoxelBuffer {
    UInt8(Array3<u8>),
    Int8(Array3<i8>),
    UInt16(Array3<u16>),
    Int16(Array3<i16>),
    UInt32(Array3<u32>),
    Int32(Array3<i32>),
    Float32(Array3<f32>),
    Float64(Array3<f64>),
}

macro_rules! for_each_buffer {
    ($buffer:expr, $array:ident => $body:expr) => {
        match $buffer {
            VoxelBuffer::UInt8($array) => $body,
            VoxelBuffer::Int8($array) => $body,
            VoxelBuffer::UInt16($array) => $body,
            VoxelBuffer::Int16($array) => $body,
            VoxelBuffer::UInt32($array) => $body,
            VoxelBuffer::Int32($array) => $body,
            VoxelBuffer::Float32($array) => $body,
            VoxelBuffer::Float64($array) => $body,
        }
    };
}

impl VoxelBuffer {
    pub fn pixel_type(&self) -> PixelType {
        match self {
            VoxelBuffer::UInt8(_) => PixelType::UInt8,
            VoxelBuffer::Int8(_) => PixelType::Int8,
            VoxelBuffer::UInt16(_) => PixelType::UInt16,
            VoxelBuffer::Int16(_) => PixelType::Int16,
            VoxelBuffer::UInt32(_) => PixelType::UInt32,
            VoxelBuffer::Int32(_) => PixelType::Int32,
            VoxelBuffer::Float32(_) => PixelType::Float32,
            VoxelBuffer::Float64(_) => PixelType::Float64,
        }
    }

    /// Array shape `(z, y, x)`
    pub fn dim(&self) -> (usize, usize, usize) {
        for_each_buffer!(self, a => a.dim())
    }

    /// Widening copy into `f32`
    pub fn to_f32(&self) -> Array3<f32> {
        for_each_buffer!(self, a => a.mapv(|v| v as f32))
    }
}

/// The "typed grid object": voxels with the geometry that places them in space
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    geometry: Geometry,
    voxels: VoxelBuffer,
}

impl Volume {
    /// Pair voxels with geometry, checking that the array shape agrees with `size`
    pub fn new(geometry: Geometry, voxels: VoxelBuffer) -> ServiceResult<Self> {
        if voxels.dim() != geometry.array_shape() {
            return Err(ServiceError::shape(
                "volume",
                format!(
                    "voxel array {:?} does not match grid size {:?}",
                    voxels.dim(),
                    geometry.size
                ),
            ));
        }
        Ok(Self { geometry, voxels })
    }

    pub fn from_f32(geometry: Geometry, data: Array3<f32>) -> ServiceResult<Self> {
        Self::new(geometry, VoxelBuffer::Float32(data))
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn voxels(&self) -> &VoxelBuffer {
        &self.voxels
    }

    pub fn pixel_type(&self) -> PixelType {
        self.voxels.pixel_type()
    }

    pub fn into_voxels(self) -> VoxelBuffer {
        self.voxels
    }

    /// Borrow the voxels as `f32`, failing for any other storage type
    pub fn as_f32(&self, stage: &'static str) -> ServiceResult<&Array3<f32>> {
        match &self.voxels {
            VoxelBuffer::Float32(a) => Ok(a),
            other => Err(ServiceError::shape(
                stage,
                format!("expected float32 voxels, found {:?}", other.pixel_type()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_spacing_rounds_up() {
        let geometry = Geometry::new([128, 128, 64], [1.0, 1.0, 1.0]);
        let coarse = geometry.with_spacing([1.5, 1.5, 1.5]);
        assert_eq!(coarse.size, [86, 86, 43]);
        assert_eq!(coarse.origin, geometry.origin);

        // Exact multiples do not gain a voxel
        let exact = Geometry::new([90, 90, 90], [1.0, 1.0, 1.0]).with_spacing([1.5, 1.5, 1.5]);
        assert_eq!(exact.size, [60, 60, 60]);
    }

    #[test]
    fn test_index_physical_inverse() {
        let geometry = Geometry {
            size: [10, 20, 30],
            spacing: [0.5, 1.0, 2.0],
            origin: [-5.0, 3.0, 7.5],
            // 90 degree rotation about z
            direction: [0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        };
        let index = [3.0, 4.5, 12.0];
        let physical = geometry.index_to_physical(index);
        let back = geometry.physical_to_index(physical);
        for axis in 0..3 {
            assert!((back[axis] - index[axis]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_huge_spacing_ratio_is_caught_by_checked_count() {
        let geometry = Geometry::new([2, 2, 2], [10_000.0; 3]);
        let target = geometry.with_spacing([1.5; 3]);
        assert_eq!(target.size, [13334; 3]);
        assert!(target.checked_voxel_count().unwrap() > DEFAULT_MAX_VOXELS);

        let overflow = Geometry::new([usize::MAX, 2, 1], [1.0; 3]);
        assert_eq!(overflow.checked_voxel_count(), None);
    }

    #[test]
    fn test_spacing_and_placement_checks() {
        let mut geometry = Geometry::new([2, 2, 2], [1.0, 0.5, 3.0]);
        assert!(geometry.has_valid_spacing());
        assert!(geometry.is_finite());

        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            geometry.spacing[1] = bad;
            assert!(!geometry.has_valid_spacing(), "spacing {bad} accepted");
        }

        geometry.origin[2] = f64::NAN;
        assert!(!geometry.is_finite());
    }

    #[test]
    fn test_congruence_includes_direction() {
        let geometry = Geometry::new([4, 4, 4], [1.0; 3]);
        let mut flipped = geometry;
        flipped.direction = [-1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0];

        assert!(geometry.is_congruent(&geometry, 1e-9));
        assert!(!geometry.is_congruent(&flipped, 1e-9));

        let mut nudged = geometry;
        nudged.direction[0] = 1.0 - 1e-12;
        assert!(geometry.is_congruent(&nudged, 1e-9));
    }

    #[test]
    fn test_volume_rejects_mismatched_shape() {
        let geometry = Geometry::new([4, 3, 2], [1.0; 3]);
        let wrong = Array3::<f32>::zeros((4, 3, 2));
        assert!(Volume::from_f32(geometry, wrong).is_err());

        let right = Array3::<f32>::zeros((2, 3, 4));
        let volume = Volume::from_f32(geometry, right).unwrap();
        assert_eq!(volume.pixel_type(), PixelType::Float32);
    }

    #[test]
    fn test_as_f32_requires_float_storage() {
        let geometry = Geometry::new([2, 2, 2], [1.0; 3]);
        let volume = Volume::new(geometry, VoxelBuffer::UInt8(Array3::zeros((2, 2, 2)))).unwrap();
        assert!(volume.as_f32("rescale").is_err());
        assert_eq!(volume.voxels().to_f32().dim(), (2, 2, 2));
    }
}
