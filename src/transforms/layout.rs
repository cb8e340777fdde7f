//! Array layout stages: grid <-> plain array, centre crop/pad to the model
//! box, and the 5D `(batch, z, y, x, channel)` layout the model consumes.

use super::{map_values, unexpected, Transform};
use crate::error::{ServiceError, ServiceResult};
use crate::types::record::{
    original_shape_field, standard_geometry_field, Record, Value,
};
use crate::types::volume::{Geometry, Volume, VoxelBuffer};
use ndarray::{s, Array3, ArrayD, ArrayView3, Axis, Ix3, Ix5};

fn to_array3(stage: &'static str, array: ArrayD<f32>) -> ServiceResult<Array3<f32>> {
    let ndim = array.ndim();
    array
        .into_dimensionality::<Ix3>()
        .map_err(|_| ServiceError::shape(stage, format!("expected a 3D array, found rank {ndim}")))
}

/// `(src_start, dst_start, len)` that centres one axis inside the other
fn axis_span(src: usize, dst: usize) -> (usize, usize, usize) {
    if dst >= src {
        (0, (dst - src) / 2, src)
    } else {
        ((src - dst) / 2, 0, dst)
    }
}

/// Centre `src` inside an array of `shape`, cropping or zero-padding each axis.
///
/// Applying it again with the original shape undoes it exactly on the
/// voxels that survived the crop.
pub fn center_window(src: ArrayView3<f32>, shape: (usize, usize, usize)) -> Array3<f32> {
    let (sz, dz, lz) = axis_span(src.dim().0, shape.0);
    let (sy, dy, ly) = axis_span(src.dim().1, shape.1);
    let (sx, dx, lx) = axis_span(src.dim().2, shape.2);

    let mut out = Array3::zeros(shape);
    out.slice_mut(s![dz..dz + lz, dy..dy + ly, dx..dx + lx])
        .assign(&src.slice(s![sz..sz + lz, sy..sy + ly, sx..sx + lx]));
    out
}

fn recorded<T>(
    record: &Record,
    field: &str,
    stage: &'static str,
    expected: &str,
    pick: impl Fn(&Value) -> Option<T>,
) -> ServiceResult<Vec<T>> {
    record
        .require(field, stage)?
        .iter()
        .map(|value| pick(value).ok_or_else(|| unexpected(stage, expected, value)))
        .collect()
}

/// Strips spatial metadata from a float grid, keeping the resampled geometry
/// so the inverse can re-attach it.
#[derive(Debug, Clone)]
pub struct GridToArray {
    field: String,
}

impl GridToArray {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

impl Transform for GridToArray {
    fn name(&self) -> &'static str {
        "grid_to_array"
    }

    fn fields(&self) -> Vec<String> {
        vec![self.field.clone(), standard_geometry_field(&self.field)]
    }

    fn apply(&self, mut record: Record) -> ServiceResult<Record> {
        let stage = self.name();
        let mut geometries = Vec::new();
        map_values(&mut record, &self.field, stage, |value| match value {
            Value::Grid(volume) => {
                let geometry = *volume.geometry();
                match volume.into_voxels() {
                    VoxelBuffer::Float32(data) => {
                        geometries.push(Value::Geometry(geometry));
                        Ok(Value::Array(data.into_dyn()))
                    }
                    other => Err(ServiceError::shape(
                        stage,
                        format!("expected float32 voxels, found {:?}", other.pixel_type()),
                    )),
                }
            }
            other => Err(unexpected(stage, "a grid", &other)),
        })?;
        record.insert(standard_geometry_field(&self.field), geometries);
        Ok(record)
    }
}

/// Centre-crops or zero-pads each array to the model box.
///
/// `size` is `[x, y, z]` like every other geometry parameter; the recorded
/// original shape is in array order `[z, y, x]`.
#[derive(Debug, Clone)]
pub struct CropOrPadToSize {
    field: String,
    size: [usize; 3],
}

impl CropOrPadToSize {
    pub fn new(field: &str, size: [usize; 3]) -> Self {
        Self {
            field: field.to_string(),
            size,
        }
    }
}

impl Transform for CropOrPadToSize {
    fn name(&self) -> &'static str {
        "crop_or_pad_to_size"
    }

    fn fields(&self) -> Vec<String> {
        vec![self.field.clone(), original_shape_field(&self.field)]
    }

    fn apply(&self, mut record: Record) -> ServiceResult<Record> {
        let stage = self.name();
        let box_shape = (self.size[2], self.size[1], self.size[0]);
        let mut shapes = Vec::new();
        map_values(&mut record, &self.field, stage, |value| match value {
            Value::Array(array) => {
                let array = to_array3(stage, array)?;
                let (z, y, x) = array.dim();
                shapes.push(Value::Shape([z, y, x]));
                Ok(Value::Array(center_window(array.view(), box_shape).into_dyn()))
            }
            other => Err(unexpected(stage, "an array", &other)),
        })?;
        record.insert(original_shape_field(&self.field), shapes);
        Ok(record)
    }
}

/// Stacks the per-sample arrays into one `(batch, z, y, x, 1)` array
#[derive(Debug, Clone)]
pub struct StackBatch {
    field: String,
}

impl StackBatch {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

impl Transform for StackBatch {
    fn name(&self) -> &'static str {
        "stack_batch"
    }

    fn fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn apply(&self, mut record: Record) -> ServiceResult<Record> {
        let stage = self.name();
        let arrays = record
            .take_required(&self.field, stage)?
            .into_iter()
            .map(|value| match value {
                Value::Array(array) => to_array3(stage, array),
                other => Err(unexpected(stage, "an array", &other)),
            })
            .collect::<ServiceResult<Vec<_>>>()?;
        if arrays.is_empty() {
            return Err(ServiceError::shape(stage, "nothing to stack"));
        }

        let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
        let batch = ndarray::stack(Axis(0), &views)
            .map_err(|e| ServiceError::shape(stage, format!("samples differ in shape: {e}")))?
            .insert_axis(Axis(4));

        record.insert(self.field.clone(), vec![Value::Array(batch.into_dyn())]);
        Ok(record)
    }
}

/// Splits a `(batch, z, y, x, 1)` array back into per-sample 3D arrays
#[derive(Debug, Clone)]
pub struct UnstackBatch {
    field: String,
}

impl UnstackBatch {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

impl Transform for UnstackBatch {
    fn name(&self) -> &'static str {
        "unstack_batch"
    }

    fn fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn apply(&self, mut record: Record) -> ServiceResult<Record> {
        let stage = self.name();
        let mut samples = Vec::new();
        for value in record.take_required(&self.field, stage)? {
            let array = match value {
                Value::Array(array) => array,
                other => return Err(unexpected(stage, "a 5D array", &other)),
            };
            let ndim = array.ndim();
            let batch = array.into_dimensionality::<Ix5>().map_err(|_| {
                ServiceError::shape(stage, format!("expected a 5D array, found rank {ndim}"))
            })?;
            let channels = batch.len_of(Axis(4));
            if channels != 1 {
                return Err(ServiceError::shape(
                    stage,
                    format!("expected a single channel, found {channels}"),
                ));
            }
            for sample in batch.axis_iter(Axis(0)) {
                let volume = sample.index_axis(Axis(3), 0).to_owned();
                samples.push(Value::Array(volume.into_dyn()));
            }
        }
        record.insert(self.field.clone(), samples);
        Ok(record)
    }
}

/// Undoes [`CropOrPadToSize`] using the shapes recorded under `reference`
#[derive(Debug, Clone)]
pub struct RestoreOriginalSize {
    field: String,
    reference: String,
}

impl RestoreOriginalSize {
    pub fn new(field: &str, reference: &str) -> Self {
        Self {
            field: field.to_string(),
            reference: reference.to_string(),
        }
    }
}

impl Transform for RestoreOriginalSize {
    fn name(&self) -> &'static str {
        "restore_original_size"
    }

    fn fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn apply(&self, mut record: Record) -> ServiceResult<Record> {
        let stage = self.name();
        let shapes = recorded(
            &record,
            &original_shape_field(&self.reference),
            stage,
            "a shape",
            |value| match value {
                Value::Shape(shape) => Some(*shape),
                _ => None,
            },
        )?;

        let mut shapes = shapes.into_iter();
        map_values(&mut record, &self.field, stage, |value| {
            let [z, y, x] = shapes
                .next()
                .ok_or_else(|| ServiceError::shape(stage, "more samples than recorded shapes"))?;
            match value {
                Value::Array(array) => {
                    let array = to_array3(stage, array)?;
                    Ok(Value::Array(center_window(array.view(), (z, y, x)).into_dyn()))
                }
                other => Err(unexpected(stage, "an array", &other)),
            }
        })?;
        Ok(record)
    }
}

/// Re-attaches the resampled geometry recorded under `reference`
#[derive(Debug, Clone)]
pub struct ArrayToGrid {
    field: String,
    reference: String,
}

impl ArrayToGrid {
    pub fn new(field: &str, reference: &str) -> Self {
        Self {
            field: field.to_string(),
            reference: reference.to_string(),
        }
    }
}

impl Transform for ArrayToGrid {
    fn name(&self) -> &'static str {
        "array_to_grid"
    }

    fn fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn apply(&self, mut record: Record) -> ServiceResult<Record> {
        let stage = self.name();
        let geometries: Vec<Geometry> = recorded(
            &record,
            &standard_geometry_field(&self.reference),
            stage,
            "a geometry",
            |value| match value {
                Value::Geometry(g) => Some(*g),
                _ => None,
            },
        )?;

        let mut geometries = geometries.into_iter();
        map_values(&mut record, &self.field, stage, |value| {
            let geometry = geometries.next().ok_or_else(|| {
                ServiceError::shape(stage, "more samples than recorded geometries")
            })?;
            match value {
                Value::Array(array) => {
                    let array = to_array3(stage, array)?;
                    Volume::from_f32(geometry, array).map(Value::Grid)
                }
                other => Err(unexpected(stage, "an array", &other)),
            }
        })?;
        Ok(record)
    }
}
