//! Inbound request parsing into the pipeline's record shape

use crate::codec;
use crate::error::{ServiceError, ServiceResult};
use crate::types::envelope::INPUT_FIELD;
use crate::types::record::{Record, Value, THRESHOLD_FIELD, UIDS_FIELD};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Multipart payload as received by the transport: every value of every
/// field, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    fields: HashMap<String, Vec<Vec<u8>>>,
}

impl RawRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.fields.entry(field.into()).or_default().push(value.into());
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.push(field, value);
        self
    }

    /// First value of a field; later values are ignored
    pub fn first(&self, field: &str) -> Option<&[u8]> {
        self.fields.get(field)?.first().map(Vec::as_slice)
    }
}

/// Threshold must be a finite float in `[0, 1]`
pub fn parse_threshold(raw: Option<&[u8]>) -> ServiceResult<f64> {
    let raw = raw.ok_or_else(|| {
        ServiceError::InvalidArgument(format!("missing '{THRESHOLD_FIELD}' field"))
    })?;
    let text = std::str::from_utf8(raw)
        .map_err(|_| ServiceError::InvalidArgument("threshold is not valid UTF-8".to_string()))?
        .trim();
    let threshold: f64 = text
        .parse()
        .map_err(|_| ServiceError::InvalidArgument(format!("threshold '{text}' is not a number")))?;
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
        return Err(ServiceError::InvalidArgument(format!(
            "threshold {threshold} is outside [0, 1]"
        )));
    }
    Ok(threshold)
}

/// Turns a raw request into a single-sample record whose image slot is a
/// scratch-file path named after a fresh identifier.
#[derive(Debug, Clone)]
pub struct RequestParser {
    scratch_dir: PathBuf,
    image_field: String,
}

impl RequestParser {
    pub fn new(scratch_dir: impl Into<PathBuf>, image_field: &str) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            image_field: image_field.to_string(),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Validate the request, then write the volume bytes to `{uid}.mha`.
    ///
    /// Nothing touches the disk unless both fields are valid, and the
    /// scratch file belongs to the returned record from then on.
    pub fn parse(&self, raw: &RawRequest) -> ServiceResult<Record> {
        let threshold = parse_threshold(raw.first(THRESHOLD_FIELD))?;
        let volume = match raw.first(INPUT_FIELD) {
            Some(bytes) if !bytes.is_empty() => bytes,
            Some(_) => {
                return Err(ServiceError::InvalidArgument(format!(
                    "'{INPUT_FIELD}' field is empty"
                )))
            }
            None => {
                return Err(ServiceError::InvalidArgument(format!(
                    "missing '{INPUT_FIELD}' field"
                )))
            }
        };

        let uid = Uuid::new_v4();
        let mut file = tempfile::Builder::new()
            .prefix(&uid.to_string())
            .suffix(&format!(".{}", codec::EXTENSION))
            .rand_bytes(0)
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| ServiceError::resource("creating input scratch file", e))?;
        file.write_all(volume)
            .and_then(|_| file.flush())
            .map_err(|e| ServiceError::resource("writing input scratch file", e))?;
        let path = file.into_temp_path();

        debug!(uid = %uid, bytes = volume.len(), threshold, path = %path.display(), "Request parsed");

        let mut record = Record::new()
            .with(self.image_field.clone(), vec![Value::Path(path.to_path_buf())])
            .with(UIDS_FIELD, vec![Value::Uid(uid)])
            .with(THRESHOLD_FIELD, vec![Value::Scalar(threshold)]);
        record.attach_scratch(path);
        Ok(record)
    }
}
