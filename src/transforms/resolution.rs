//! Resampling between the caller's voxel spacing and the model's

use super::{map_values, unexpected, Transform};
use crate::error::{ServiceError, ServiceResult};
use crate::types::record::{original_geometry_field, Record, Value};
use crate::types::volume::{Geometry, Volume, DEFAULT_MAX_VOXELS};
use ndarray::Array3;

/// Samples this far outside the outermost voxel centre are still clamped to
/// the edge rather than treated as background.
const EDGE_TOLERANCE: f64 = 0.5 + 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    NearestNeighbor,
    Linear,
}

fn sample(data: &Array3<f32>, size: [usize; 3], index: [f64; 3], interpolation: Interpolation) -> f32 {
    let mut c = [0.0f64; 3];
    for axis in 0..3 {
        let upper = size[axis] as f64 - 1.0;
        if index[axis] < -EDGE_TOLERANCE || index[axis] > upper + EDGE_TOLERANCE {
            return 0.0;
        }
        c[axis] = index[axis].clamp(0.0, upper);
    }

    match interpolation {
        Interpolation::NearestNeighbor => {
            let [x, y, z] = c.map(|v| v.round() as usize);
            data[[z, y, x]]
        }
        Interpolation::Linear => {
            let lo = c.map(|v| v.floor() as usize);
            let hi = [
                (lo[0] + 1).min(size[0] - 1),
                (lo[1] + 1).min(size[1] - 1),
                (lo[2] + 1).min(size[2] - 1),
            ];
            let f = [
                (c[0] - lo[0] as f64) as f32,
                (c[1] - lo[1] as f64) as f32,
                (c[2] - lo[2] as f64) as f32,
            ];
            let at = |x: usize, y: usize, z: usize| data[[z, y, x]];
            let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;

            let c00 = lerp(at(lo[0], lo[1], lo[2]), at(hi[0], lo[1], lo[2]), f[0]);
            let c10 = lerp(at(lo[0], hi[1], lo[2]), at(hi[0], hi[1], lo[2]), f[0]);
            let c01 = lerp(at(lo[0], lo[1], hi[2]), at(hi[0], lo[1], hi[2]), f[0]);
            let c11 = lerp(at(lo[0], hi[1], hi[2]), at(hi[0], hi[1], hi[2]), f[0]);
            let c0 = lerp(c00, c10, f[1]);
            let c1 = lerp(c01, c11, f[1]);
            lerp(c0, c1, f[2])
        }
    }
}

/// Resample a float grid onto `target`, mapping through physical space.
pub fn resample(source: &Volume, target: &Geometry, interpolation: Interpolation) -> ServiceResult<Volume> {
    let data = source.as_f32("resample")?;
    let src = source.geometry();

    // Target index -> source continuous index is affine; recover it from
    // the images of the origin and the three unit steps.
    let base = src.physical_to_index(target.index_to_physical([0.0, 0.0, 0.0]));
    let step = |unit: [f64; 3]| {
        let p = src.physical_to_index(target.index_to_physical(unit));
        [p[0] - base[0], p[1] - base[1], p[2] - base[2]]
    };
    let sx = step([1.0, 0.0, 0.0]);
    let sy = step([0.0, 1.0, 0.0]);
    let sz = step([0.0, 0.0, 1.0]);

    let out = Array3::from_shape_fn(target.array_shape(), |(z, y, x)| {
        let (x, y, z) = (x as f64, y as f64, z as f64);
        let index = [
            base[0] + x * sx[0] + y * sy[0] + z * sz[0],
            base[1] + x * sx[1] + y * sy[1] + z * sz[1],
            base[2] + x * sx[2] + y * sy[2] + z * sz[2],
        ];
        sample(data, src.size, index, interpolation)
    });

    Volume::from_f32(*target, out)
}

/// Resamples a float grid to the model's fixed spacing with trilinear
/// interpolation, recording the original geometry for the inverse.
#[derive(Debug, Clone)]
pub struct ResampleToResolution {
    field: String,
    spacing: [f64; 3],
    max_voxels: usize,
}

impl ResampleToResolution {
    pub fn new(field: &str, spacing: [f64; 3]) -> Self {
        Self {
            field: field.to_string(),
            spacing,
            max_voxels: DEFAULT_MAX_VOXELS,
        }
    }

    /// Refuse to allocate resampled grids above `max_voxels` voxels
    pub fn with_max_voxels(mut self, max_voxels: usize) -> Self {
        self.max_voxels = max_voxels;
        self
    }
}

impl Transform for ResampleToResolution {
    fn name(&self) -> &'static str {
        "resample_to_resolution"
    }

    fn fields(&self) -> Vec<String> {
        vec![self.field.clone(), original_geometry_field(&self.field)]
    }

    fn apply(&self, mut record: Record) -> ServiceResult<Record> {
        let stage = self.name();
        let mut originals = Vec::new();
        map_values(&mut record, &self.field, stage, |value| match value {
            Value::Grid(volume) => {
                let original = *volume.geometry();
                if !original.has_valid_spacing() {
                    return Err(ServiceError::shape(
                        stage,
                        format!("grid spacing {:?} is not positive", original.spacing),
                    ));
                }
                let target = original.with_spacing(self.spacing);
                match target.checked_voxel_count() {
                    Some(count) if count <= self.max_voxels => {}
                    _ => {
                        return Err(ServiceError::shape(
                            stage,
                            format!(
                                "resampling {:?} at {:?} mm gives {:?} voxels, above the limit of {}",
                                original.size, original.spacing, target.size, self.max_voxels
                            ),
                        ))
                    }
                }
                let resampled = resample(&volume, &target, Interpolation::Linear)?;
                originals.push(Value::Geometry(original));
                Ok(Value::Grid(resampled))
            }
            other => Err(unexpected(stage, "a grid", &other)),
        })?;
        record.insert(original_geometry_field(&self.field), originals);
        Ok(record)
    }
}

/// Resamples a label grid back onto the geometry recorded under `reference`
/// by [`ResampleToResolution`]. Nearest-neighbour keeps labels binary.
#[derive(Debug, Clone)]
pub struct ResampleToOriginalResolution {
    field: String,
    reference: String,
}

impl ResampleToOriginalResolution {
    pub fn new(field: &str, reference: &str) -> Self {
        Self {
            field: field.to_string(),
            reference: reference.to_string(),
        }
    }
}

impl Transform for ResampleToOriginalResolution {
    fn name(&self) -> &'static str {
        "resample_to_original_resolution"
    }

    fn fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn apply(&self, mut record: Record) -> ServiceResult<Record> {
        let stage = self.name();
        let originals = record
            .require(&original_geometry_field(&self.reference), stage)?
            .iter()
            .map(|value| match value {
                Value::Geometry(g) => Ok(*g),
                other => Err(unexpected(stage, "a geometry", other)),
            })
            .collect::<ServiceResult<Vec<Geometry>>>()?;

        let mut originals = originals.into_iter();
        map_values(&mut record, &self.field, stage, |value| {
            let target = originals.next().ok_or_else(|| {
                ServiceError::shape(stage, "more samples than recorded geometries")
            })?;
            match value {
                Value::Grid(volume) => {
                    resample(&volume, &target, Interpolation::NearestNeighbor).map(Value::Grid)
                }
                other => Err(unexpected(stage, "a grid", &other)),
            }
        })?;
        Ok(record)
    }
}
