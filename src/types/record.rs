//! Per-request record flowing through the pipeline

use crate::error::{ServiceError, ServiceResult};
use crate::types::volume::{Geometry, Volume};
use ndarray::ArrayD;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use uuid::Uuid;

/// Input volume slot. Its representation changes stage by stage.
pub const IMAGE_FIELD: &str = "images";
/// Inference output slot, kept apart from the input slot
pub const SEGMENTATION_FIELD: &str = "segmentation";
pub const UIDS_FIELD: &str = "uids";
pub const THRESHOLD_FIELD: &str = "threshold";
pub const ELAPSED_TIME_FIELD: &str = "elapsed_time";

/// Geometry of the grid before it was resampled to model resolution
pub fn original_geometry_field(field: &str) -> String {
    format!("{field}_original_geometry")
}

/// Geometry of the resampled grid, kept when spatial metadata is stripped
pub fn standard_geometry_field(field: &str) -> String {
    format!("{field}_standard_geometry")
}

/// Array shape before cropping/padding to the model box
pub fn original_shape_field(field: &str) -> String {
    format!("{field}_original_shape")
}

/// One per-sample value. The variant in a slot tells which pipeline stage
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Path(PathBuf),
    Grid(Volume),
    Array(ArrayD<f32>),
    Uid(Uuid),
    Scalar(f64),
    Geometry(Geometry),
    Shape([usize; 3]),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Path(_) => "path",
            Value::Grid(_) => "grid",
            Value::Array(a) if a.ndim() == 5 => "5d array",
            Value::Array(_) => "array",
            Value::Uid(_) => "uid",
            Value::Scalar(_) => "scalar",
            Value::Geometry(_) => "geometry",
            Value::Shape(_) => "shape",
        }
    }
}

/// Mapping from field name to per-sample values, plus the scratch files the
/// request owns. Scratch files are removed when the record is dropped,
/// whichever way the request ends.
#[derive(Debug, Default)]
pub struct Record {
    fields: BTreeMap<String, Vec<Value>>,
    scratch: Vec<TempPath>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, values: Vec<Value>) {
        self.fields.insert(field.into(), values);
    }

    pub fn with(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.insert(field, values);
        self
    }

    pub fn get(&self, field: &str) -> Option<&[Value]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    pub fn take(&mut self, field: &str) -> Option<Vec<Value>> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Values of a field the stage cannot run without
    pub fn require(&self, field: &str, stage: &'static str) -> ServiceResult<&[Value]> {
        self.get(field)
            .ok_or_else(|| ServiceError::shape(stage, format!("record has no field '{field}'")))
    }

    pub fn take_required(&mut self, field: &str, stage: &'static str) -> ServiceResult<Vec<Value>> {
        self.take(field)
            .ok_or_else(|| ServiceError::shape(stage, format!("record has no field '{field}'")))
    }

    pub fn fields(&self) -> &BTreeMap<String, Vec<Value>> {
        &self.fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// First scalar of a field
    pub fn scalar(&self, field: &str) -> Option<f64> {
        match self.get(field)?.first()? {
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn uid(&self) -> Option<Uuid> {
        match self.get(UIDS_FIELD)?.first()? {
            Value::Uid(uid) => Some(*uid),
            _ => None,
        }
    }

    /// Hand a scratch file to the record so it lives exactly as long as the request
    pub fn attach_scratch(&mut self, path: TempPath) {
        self.scratch.push(path);
    }

    pub fn scratch_paths(&self) -> impl Iterator<Item = &Path> {
        self.scratch.iter().map(|p| p.as_ref())
    }
}
