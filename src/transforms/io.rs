//! Filename to grid decoding

use super::{map_values, unexpected, Transform};
use crate::codec;
use crate::error::ServiceResult;
use crate::types::record::{Record, Value};
use crate::types::volume::DEFAULT_MAX_VOXELS;

/// Reads the volume file a path points at into an in-memory grid
#[derive(Debug, Clone)]
pub struct DecodeVolumeFile {
    field: String,
    max_voxels: usize,
}

impl DecodeVolumeFile {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
            max_voxels: DEFAULT_MAX_VOXELS,
        }
    }

    /// Refuse files whose header declares more than `max_voxels` voxels
    pub fn with_max_voxels(mut self, max_voxels: usize) -> Self {
        self.max_voxels = max_voxels;
        self
    }
}

impl Transform for DecodeVolumeFile {
    fn name(&self) -> &'static str {
        "decode_volume_file"
    }

    fn fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn apply(&self, mut record: Record) -> ServiceResult<Record> {
        let stage = self.name();
        map_values(&mut record, &self.field, stage, |value| match value {
            Value::Path(path) => codec::read_file_with_limit(&path, self.max_voxels).map(Value::Grid),
            other => Err(unexpected(stage, "a file path", &other)),
        })?;
        Ok(record)
    }
}
