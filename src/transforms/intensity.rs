//! Voxel storage normalisation and intensity rescaling

use super::{map_values, unexpected, Transform};
use crate::error::ServiceResult;
use crate::types::record::{Record, Value};
use crate::types::volume::{Volume, VoxelBuffer};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Converts grid voxels of any storage type to `f32`.
///
/// A storage-format step only; values are not interpolated or scaled.
#[derive(Debug, Clone)]
pub struct CastToFloat32 {
    field: String,
}

impl CastToFloat32 {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

impl Transform for CastToFloat32 {
    fn name(&self) -> &'static str {
        "cast_to_float32"
    }

    fn fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn apply(&self, mut record: Record) -> ServiceResult<Record> {
        let stage = self.name();
        map_values(&mut record, &self.field, stage, |value| match value {
            Value::Grid(volume) if matches!(volume.voxels(), VoxelBuffer::Float32(_)) => {
                Ok(Value::Grid(volume))
            }
            Value::Grid(volume) => {
                let data = volume.voxels().to_f32();
                Volume::from_f32(*volume.geometry(), data).map(Value::Grid)
            }
            other => Err(unexpected(stage, "a grid", &other)),
        })?;
        Ok(record)
    }
}

fn default_output_max() -> f32 {
    1.0
}

/// Mapping from scanner intensities to the range the model was trained on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IntensityRescale {
    /// Linear map of the volume's own min/max onto `[output_min, output_max]`
    MinMax {
        #[serde(default)]
        output_min: f32,
        #[serde(default = "default_output_max")]
        output_max: f32,
    },
    /// Fixed `v * scale + shift`
    Affine { scale: f32, shift: f32 },
    /// Clamp to `[lower, upper]`, then map linearly onto `[output_min, output_max]`
    Window {
        lower: f32,
        upper: f32,
        #[serde(default)]
        output_min: f32,
        #[serde(default = "default_output_max")]
        output_max: f32,
    },
}

impl Default for IntensityRescale {
    fn default() -> Self {
        IntensityRescale::MinMax {
            output_min: 0.0,
            output_max: 1.0,
        }
    }
}

fn linear_map(data: &mut Array3<f32>, lower: f32, upper: f32, output_min: f32, output_max: f32) {
    let range = upper - lower;
    if !(range.is_finite() && range > 0.0) {
        data.fill(output_min);
        return;
    }
    let span = output_max - output_min;
    data.mapv_inplace(|v| (v.clamp(lower, upper) - lower) / range * span + output_min);
}

impl IntensityRescale {
    pub fn apply(&self, data: &mut Array3<f32>) {
        match *self {
            IntensityRescale::MinMax {
                output_min,
                output_max,
            } => {
                let (lower, upper) = data
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    });
                linear_map(data, lower, upper, output_min, output_max);
            }
            IntensityRescale::Affine { scale, shift } => {
                data.mapv_inplace(|v| v * scale + shift);
            }
            IntensityRescale::Window {
                lower,
                upper,
                output_min,
                output_max,
            } => linear_map(data, lower, upper, output_min, output_max),
        }
    }
}

/// Applies the deployment's [`IntensityRescale`] to a float grid.
///
/// Never inverted: the service returns labels, not intensities.
#[derive(Debug, Clone)]
pub struct RescaleIntensity {
    field: String,
    rescale: IntensityRescale,
}

impl RescaleIntensity {
    pub fn new(field: &str, rescale: IntensityRescale) -> Self {
        Self {
            field: field.to_string(),
            rescale,
        }
    }
}

impl Transform for RescaleIntensity {
    fn name(&self) -> &'static str {
        "rescale_intensity"
    }

    fn fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn apply(&self, mut record: Record) -> ServiceResult<Record> {
        let stage = self.name();
        map_values(&mut record, &self.field, stage, |value| match value {
            Value::Grid(volume) => {
                let mut data = volume.as_f32(stage)?.clone();
                self.rescale.apply(&mut data);
                Volume::from_f32(*volume.geometry(), data).map(Value::Grid)
            }
            other => Err(unexpected(stage, "a grid", &other)),
        })?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::test_support::*;
    use crate::types::record::IMAGE_FIELD;
    use crate::types::volume::PixelType;

    fn grid(record: &Record) -> &Volume {
        match &record.get(IMAGE_FIELD).unwrap()[0] {
            Value::Grid(v) => v,
            other => panic!("expected grid, found {}", other.kind()),
        }
    }

    #[test]
    fn test_cast_keeps_values_and_geometry() {
        let volume = ramp_volume([4, 3, 2], [1.0, 1.0, 3.0]);
        let transform = CastToFloat32::new(IMAGE_FIELD);
        let before = record_with(IMAGE_FIELD, Value::Grid(volume.clone()));
        let after = transform
            .apply(record_with(IMAGE_FIELD, Value::Grid(volume.clone())))
            .unwrap();

        let cast = grid(&after);
        assert_eq!(cast.pixel_type(), PixelType::Float32);
        assert_eq!(cast.geometry(), volume.geometry());
        assert_eq!(cast.as_f32("test").unwrap()[[1, 2, 3]], (3 + 4 + 3) as f32);
        assert_isolated(&before, &after, &transform.fields());
    }

    #[test]
    fn test_rescale_requires_float_grid() {
        let transform = RescaleIntensity::new(IMAGE_FIELD, IntensityRescale::default());
        let record = record_with(IMAGE_FIELD, Value::Grid(ramp_volume([2, 2, 2], [1.0; 3])));
        assert_eq!(transform.apply(record).unwrap_err().kind(), "shape_mismatch");
    }

    #[test]
    fn test_rescale_is_isolated() {
        let float_grid = || {
            let volume = ramp_volume([4, 3, 2], [1.0; 3]);
            Value::Grid(Volume::from_f32(*volume.geometry(), volume.voxels().to_f32()).unwrap())
        };
        let transform = RescaleIntensity::new(IMAGE_FIELD, IntensityRescale::default());
        let before = record_with(IMAGE_FIELD, float_grid());
        let after = transform.apply(record_with(IMAGE_FIELD, float_grid())).unwrap();

        assert_ne!(after.get(IMAGE_FIELD), before.get(IMAGE_FIELD));
        assert_isolated(&before, &after, &transform.fields());
    }

    #[test]
    fn test_min_max_maps_to_unit_range() {
        let mut data = Array3::from_shape_vec((1, 1, 4), vec![-100.0, 0.0, 100.0, 300.0]).unwrap();
        IntensityRescale::default().apply(&mut data);
        assert_eq!(data.as_slice().unwrap(), &[0.0, 0.25, 0.5, 1.0]);
    }

    #[test]
    fn test_constant_volume_maps_to_output_min() {
        let mut data = Array3::from_elem((2, 2, 2), 42.0f32);
        IntensityRescale::default().apply(&mut data);
        assert!(data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_window_clamps() {
        let mut data = Array3::from_shape_vec((1, 1, 3), vec![-2000.0, 40.0, 2000.0]).unwrap();
        IntensityRescale::Window {
            lower: -160.0,
            upper: 240.0,
            output_min: 0.0,
            output_max: 1.0,
        }
        .apply(&mut data);
        assert_eq!(data.as_slice().unwrap(), &[0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_rescale_modes_from_config_syntax() {
        let affine: IntensityRescale =
            serde_json::from_str(r#"{"mode":"affine","scale":0.5,"shift":-1.0}"#).unwrap();
        assert_eq!(
            affine,
            IntensityRescale::Affine {
                scale: 0.5,
                shift: -1.0
            }
        );
        let min_max: IntensityRescale = serde_json::from_str(r#"{"mode":"min_max"}"#).unwrap();
        assert_eq!(min_max, IntensityRescale::default());
    }
}
