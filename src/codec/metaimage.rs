//! MetaImage (`.mha`) reader and writer.
//!
//! Handles the single-file layout: an ASCII `Key = Value` header terminated by
//! `ElementDataFile = LOCAL`, followed by the raw or zlib-compressed voxel
//! block in x-fastest order.

use crate::error::{ServiceError, ServiceResult};
use crate::types::volume::{
    Geometry, PixelType, Volume, VoxelBuffer, DEFAULT_MAX_VOXELS, IDENTITY_DIRECTION,
};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::Array3;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

/// File extension of the container format
pub const EXTENSION: &str = "mha";

fn codec_err(message: impl Into<String>) -> ServiceError {
    ServiceError::Codec(message.into())
}

fn element_type_name(pixel: PixelType) -> &'static str {
    match pixel {
        PixelType::UInt8 => "MET_UCHAR",
        PixelType::Int8 => "MET_CHAR",
        PixelType::UInt16 => "MET_USHORT",
        PixelType::Int16 => "MET_SHORT",
        PixelType::UInt32 => "MET_UINT",
        PixelType::Int32 => "MET_INT",
        PixelType::Float32 => "MET_FLOAT",
        PixelType::Float64 => "MET_DOUBLE",
    }
}

fn parse_element_type(name: &str) -> ServiceResult<PixelType> {
    match name {
        "MET_UCHAR" => Ok(PixelType::UInt8),
        "MET_CHAR" => Ok(PixelType::Int8),
        "MET_USHORT" => Ok(PixelType::UInt16),
        "MET_SHORT" => Ok(PixelType::Int16),
        "MET_UINT" => Ok(PixelType::UInt32),
        "MET_INT" => Ok(PixelType::Int32),
        "MET_FLOAT" => Ok(PixelType::Float32),
        "MET_DOUBLE" => Ok(PixelType::Float64),
        other => Err(codec_err(format!("unsupported ElementType '{other}'"))),
    }
}

/// Parsed `Key = Value` header
struct Header {
    entries: HashMap<String, String>,
}

impl Header {
    /// Split the header from the data block
    fn split(bytes: &[u8]) -> ServiceResult<(Self, &[u8])> {
        let mut entries = HashMap::new();
        let mut offset = 0;

        loop {
            let rest = &bytes[offset..];
            let line_end = rest
                .iter()
                .position(|&b| b == b'\n')
                .ok_or_else(|| codec_err("header ends before ElementDataFile"))?;
            let line = std::str::from_utf8(&rest[..line_end])
                .map_err(|_| codec_err("header is not valid text"))?
                .trim();
            offset += line_end + 1;

            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| codec_err(format!("malformed header line '{line}'")))?;
            let key = key.trim().to_string();
            let done = key == "ElementDataFile";
            entries.insert(key, value.trim().to_string());
            if done {
                break;
            }
        }

        Ok((Self { entries }, &bytes[offset..]))
    }

    fn get(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|k| self.entries.get(*k))
            .map(String::as_str)
    }

    fn flag(&self, keys: &[&str]) -> bool {
        self.get(keys)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    fn numbers<T: std::str::FromStr>(&self, keys: &[&str]) -> ServiceResult<Option<Vec<T>>> {
        let Some(raw) = self.get(keys) else {
            return Ok(None);
        };
        raw.split_whitespace()
            .map(|token| {
                token
                    .parse::<T>()
                    .map_err(|_| codec_err(format!("bad number '{token}' in {}", keys[0])))
            })
            .collect::<ServiceResult<Vec<T>>>()
            .map(Some)
    }

    fn triple<T: std::str::FromStr + Copy>(
        &self,
        keys: &[&str],
        default: [T; 3],
    ) -> ServiceResult<[T; 3]> {
        match self.numbers::<T>(keys)? {
            None => Ok(default),
            Some(values) if values.len() == 3 => Ok([values[0], values[1], values[2]]),
            Some(values) => Err(ServiceError::shape(
                "metaimage",
                format!("{} has {} components, expected 3", keys[0], values.len()),
            )),
        }
    }
}

macro_rules! decode_as {
    ($raw:expr, $shape:expr, $big_endian:expr, $t:ty, $variant:ident) => {{
        let values: Vec<$t> = $raw
            .chunks_exact(std::mem::size_of::<$t>())
            .map(|chunk| {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(chunk);
                if $big_endian {
                    <$t>::from_be_bytes(buf)
                } else {
                    <$t>::from_le_bytes(buf)
                }
            })
            .collect();
        Array3::from_shape_vec($shape, values)
            .map(VoxelBuffer::$variant)
            .map_err(|e| codec_err(format!("voxel block does not fit grid: {e}")))
    }};
}

fn decode_voxels(
    pixel: PixelType,
    raw: &[u8],
    shape: (usize, usize, usize),
    big_endian: bool,
) -> ServiceResult<VoxelBuffer> {
    match pixel {
        PixelType::UInt8 => decode_as!(raw, shape, big_endian, u8, UInt8),
        PixelType::Int8 => decode_as!(raw, shape, big_endian, i8, Int8),
        PixelType::UInt16 => decode_as!(raw, shape, big_endian, u16, UInt16),
        PixelType::Int16 => decode_as!(raw, shape, big_endian, i16, Int16),
        PixelType::UInt32 => decode_as!(raw, shape, big_endian, u32, UInt32),
        PixelType::Int32 => decode_as!(raw, shape, big_endian, i32, Int32),
        PixelType::Float32 => decode_as!(raw, shape, big_endian, f32, Float32),
        PixelType::Float64 => decode_as!(raw, shape, big_endian, f64, Float64),
    }
}

fn encode_voxels(voxels: &VoxelBuffer) -> Vec<u8> {
    macro_rules! le_bytes {
        ($array:expr) => {
            $array.iter().flat_map(|v| v.to_le_bytes()).collect()
        };
    }
    match voxels {
        VoxelBuffer::UInt8(a) => le_bytes!(a),
        VoxelBuffer::Int8(a) => le_bytes!(a),
        VoxelBuffer::UInt16(a) => le_bytes!(a),
        VoxelBuffer::Int16(a) => le_bytes!(a),
        VoxelBuffer::UInt32(a) => le_bytes!(a),
        VoxelBuffer::Int32(a) => le_bytes!(a),
        VoxelBuffer::Float32(a) => le_bytes!(a),
        VoxelBuffer::Float64(a) => le_bytes!(a),
    }
}

/// Decode an in-memory MetaImage of at most [`DEFAULT_MAX_VOXELS`] voxels
pub fn decode(bytes: &[u8]) -> ServiceResult<Volume> {
    decode_with_limit(bytes, DEFAULT_MAX_VOXELS)
}

/// Decode an in-memory MetaImage, rejecting grids above `max_voxels` before
/// any voxel memory is allocated.
pub fn decode_with_limit(bytes: &[u8], max_voxels: usize) -> ServiceResult<Volume> {
    let (header, body) = Header::split(bytes)?;

    if let Some(ndims) = header.get(&["NDims"]) {
        if ndims != "3" {
            return Err(ServiceError::shape(
                "metaimage",
                format!("expected a 3D volume, found NDims = {ndims}"),
            ));
        }
    }
    if let Some(channels) = header.get(&["ElementNumberOfChannels"]) {
        if channels != "1" {
            return Err(ServiceError::shape(
                "metaimage",
                format!("expected a scalar volume, found {channels} channels"),
            ));
        }
    }
    match header.get(&["ElementDataFile"]) {
        Some(location) if location.eq_ignore_ascii_case("LOCAL") => {}
        Some(location) => {
            return Err(codec_err(format!(
                "detached data file '{location}' is not supported"
            )))
        }
        None => return Err(codec_err("missing ElementDataFile")),
    }

    let size: [usize; 3] = header.triple(&["DimSize"], [0; 3])?;
    if size.contains(&0) {
        return Err(codec_err("missing or empty DimSize"));
    }
    let spacing = header.triple(&["ElementSpacing", "ElementSize"], [1.0; 3])?;
    let origin = header.triple(&["Offset", "Origin", "Position"], [0.0; 3])?;
    let direction = match header.numbers::<f64>(&["TransformMatrix", "Rotation", "Orientation"])? {
        None => IDENTITY_DIRECTION,
        Some(values) if values.len() == 9 => {
            let mut matrix = [0.0; 9];
            matrix.copy_from_slice(&values);
            matrix
        }
        Some(values) => {
            return Err(ServiceError::shape(
                "metaimage",
                format!("TransformMatrix has {} components, expected 9", values.len()),
            ))
        }
    };
    let pixel = parse_element_type(
        header
            .get(&["ElementType"])
            .ok_or_else(|| codec_err("missing ElementType"))?,
    )?;
    let big_endian = header.flag(&["BinaryDataByteOrderMSB", "ElementByteOrderMSB"]);

    let geometry = Geometry {
        size,
        spacing,
        origin,
        direction,
    };
    if !geometry.has_valid_spacing() {
        return Err(codec_err(format!(
            "ElementSpacing must be finite and positive, found {spacing:?}"
        )));
    }
    if !geometry.is_finite() {
        return Err(codec_err("Offset or TransformMatrix is not finite"));
    }

    let voxel_count = geometry
        .checked_voxel_count()
        .filter(|&count| count <= max_voxels)
        .ok_or_else(|| {
            codec_err(format!(
                "DimSize {size:?} exceeds the limit of {max_voxels} voxels"
            ))
        })?;
    let expected = voxel_count
        .checked_mul(pixel.byte_width())
        .ok_or_else(|| codec_err(format!("DimSize {size:?} overflows the voxel block size")))?;

    let raw: Cow<'_, [u8]> = if header.flag(&["CompressedData"]) {
        // One byte past the declared size is enough to tell an oversized stream
        let mut inflated = Vec::new();
        ZlibDecoder::new(body)
            .take((expected as u64).saturating_add(1))
            .read_to_end(&mut inflated)
            .map_err(|e| codec_err(format!("zlib inflate failed: {e}")))?;
        if inflated.len() > expected {
            return Err(codec_err(format!(
                "inflated voxel block is larger than the {expected} bytes DimSize declares"
            )));
        }
        Cow::Owned(inflated)
    } else {
        Cow::Borrowed(body)
    };
    if raw.len() < expected {
        return Err(codec_err(format!(
            "voxel block truncated: {} bytes, expected {expected}",
            raw.len()
        )));
    }

    let voxels = decode_voxels(pixel, &raw[..expected], geometry.array_shape(), big_endian)?;
    Volume::new(geometry, voxels)
}

/// Encode a volume as a little-endian MetaImage, optionally zlib-compressed
pub fn encode(volume: &Volume, compress: bool) -> ServiceResult<Vec<u8>> {
    let geometry = volume.geometry();
    let raw = encode_voxels(volume.voxels());

    let body = if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&raw)
            .and_then(|_| encoder.finish())
            .map_err(|e| codec_err(format!("zlib deflate failed: {e}")))?
    } else {
        raw
    };

    let join = |values: &[f64]| {
        values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mut header = String::new();
    header.push_str("ObjectType = Image\n");
    header.push_str("NDims = 3\n");
    header.push_str("BinaryData = True\n");
    header.push_str("BinaryDataByteOrderMSB = False\n");
    if compress {
        header.push_str("CompressedData = True\n");
        header.push_str(&format!("CompressedDataSize = {}\n", body.len()));
    } else {
        header.push_str("CompressedData = False\n");
    }
    header.push_str(&format!("TransformMatrix = {}\n", join(&geometry.direction)));
    header.push_str(&format!("Offset = {}\n", join(&geometry.origin)));
    header.push_str("CenterOfRotation = 0 0 0\n");
    header.push_str(&format!("ElementSpacing = {}\n", join(&geometry.spacing)));
    header.push_str(&format!(
        "DimSize = {} {} {}\n",
        geometry.size[0], geometry.size[1], geometry.size[2]
    ));
    header.push_str(&format!(
        "ElementType = {}\n",
        element_type_name(volume.pixel_type())
    ));
    header.push_str("ElementDataFile = LOCAL\n");

    let mut bytes = header.into_bytes();
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

pub fn read_file(path: &Path) -> ServiceResult<Volume> {
    read_file_with_limit(path, DEFAULT_MAX_VOXELS)
}

pub fn read_file_with_limit(path: &Path, max_voxels: usize) -> ServiceResult<Volume> {
    let bytes = std::fs::read(path)
        .map_err(|e| ServiceError::resource(format!("reading {}", path.display()), e))?;
    decode_with_limit(&bytes, max_voxels)
}

pub fn write_file(path: &Path, volume: &Volume, compress: bool) -> ServiceResult<()> {
    let bytes = encode(volume, compress)?;
    std::fs::write(path, bytes)
        .map_err(|e| ServiceError::resource(format!("writing {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_volume() -> Volume {
        let geometry = Geometry {
            size: [4, 3, 2],
            spacing: [0.5, 0.75, 2.0],
            origin: [-10.0, 4.5, 0.25],
            direction: IDENTITY_DIRECTION,
        };
        let data = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (z * 100 + y * 10 + x) as i16);
        Volume::new(geometry, VoxelBuffer::Int16(data)).unwrap()
    }

    #[test]
    fn test_compressed_file_preserves_geometry_and_voxels() {
        let volume = sample_volume();
        let bytes = encode(&volume, true).unwrap();
        let text = String::from_utf8_lossy(&bytes[..200.min(bytes.len())]).to_string();
        assert!(text.contains("CompressedData = True"));
        assert!(text.contains("ElementType = MET_SHORT"));

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, volume);
    }

    #[test]
    fn test_decode_big_endian_uncompressed() {
        let mut bytes = b"ObjectType = Image\nNDims = 3\nBinaryData = True\n\
BinaryDataByteOrderMSB = True\nDimSize = 2 1 1\nElementSpacing = 1 1 1\n\
ElementType = MET_USHORT\nElementDataFile = LOCAL\n"
            .to_vec();
        bytes.extend_from_slice(&[0x01, 0x02, 0x00, 0x07]);

        let volume = decode(&bytes).unwrap();
        match volume.voxels() {
            VoxelBuffer::UInt16(a) => {
                assert_eq!(a[[0, 0, 0]], 0x0102);
                assert_eq!(a[[0, 0, 1]], 7);
            }
            other => panic!("unexpected buffer {:?}", other.pixel_type()),
        }
    }

    #[test]
    fn test_rejects_two_dimensional_image() {
        let bytes = b"ObjectType = Image\nNDims = 2\nDimSize = 2 2\n\
ElementType = MET_UCHAR\nElementDataFile = LOCAL\n\x00\x00\x00\x00";
        let err = decode(bytes).unwrap_err();
        assert_eq!(err.kind(), "shape_mismatch");
    }

    #[test]
    fn test_rejects_truncated_and_garbage_payloads() {
        let truncated = b"NDims = 3\nDimSize = 2 2 2\nElementType = MET_FLOAT\n\
ElementDataFile = LOCAL\n\x00\x00";
        assert_eq!(decode(truncated).unwrap_err().kind(), "codec");
        assert_eq!(decode(b"definitely not a volume").unwrap_err().kind(), "codec");
        assert_eq!(decode(&[]).unwrap_err().kind(), "codec");
    }

    fn compressed(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(&encoder.finish().unwrap());
        bytes
    }

    #[test]
    fn test_rejects_oversized_dim_size_before_allocating() {
        let bytes = compressed(
            "NDims = 3\nCompressedData = True\nDimSize = 100000 100000 100000\n\
ElementType = MET_DOUBLE\nElementDataFile = LOCAL\n",
            &[0u8; 16],
        );
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), "codec");
        assert!(err.to_string().contains("exceeds the limit"), "{err}");
    }

    #[test]
    fn test_rejects_dim_size_overflow() {
        let bytes = format!(
            "NDims = 3\nDimSize = {} 4 4\nElementType = MET_UCHAR\nElementDataFile = LOCAL\n",
            usize::MAX
        );
        let err = decode_with_limit(bytes.as_bytes(), usize::MAX).unwrap_err();
        assert_eq!(err.kind(), "codec");
    }

    #[test]
    fn test_limit_is_configurable() {
        let bytes = encode(&sample_volume(), true).unwrap();
        assert!(decode_with_limit(&bytes, 24).is_ok());
        assert_eq!(decode_with_limit(&bytes, 23).unwrap_err().kind(), "codec");
    }

    #[test]
    fn test_rejects_inflated_payload_longer_than_declared() {
        let header = "NDims = 3\nCompressedData = True\nDimSize = 2 2 2\n\
ElementType = MET_UCHAR\nElementDataFile = LOCAL\n";

        let err = decode(&compressed(header, &[7u8; 4096])).unwrap_err();
        assert_eq!(err.kind(), "codec");
        assert!(err.to_string().contains("larger than"), "{err}");

        let err = decode(&compressed(header, &[7u8; 5])).unwrap_err();
        assert!(err.to_string().contains("truncated"), "{err}");

        let volume = decode(&compressed(header, &[7u8; 8])).unwrap();
        assert_eq!(volume.geometry().size, [2, 2, 2]);
    }

    #[test]
    fn test_rejects_degenerate_spacing() {
        for spacing in ["0 1 1", "1 -1 1", "1 1 NaN", "inf 1 1"] {
            let mut bytes = format!(
                "NDims = 3\nDimSize = 2 1 1\nElementSpacing = {spacing}\n\
ElementType = MET_UCHAR\nElementDataFile = LOCAL\n"
            )
            .into_bytes();
            bytes.extend_from_slice(&[1, 2]);
            let err = decode(&bytes).unwrap_err();
            assert_eq!(err.kind(), "codec", "spacing '{spacing}' accepted");
        }
    }

    #[test]
    fn test_rejects_non_finite_placement() {
        let mut bytes = b"NDims = 3\nDimSize = 2 1 1\nOffset = 0 NaN 0\n\
ElementType = MET_UCHAR\nElementDataFile = LOCAL\n"
            .to_vec();
        bytes.extend_from_slice(&[1, 2]);
        assert_eq!(decode(&bytes).unwrap_err().kind(), "codec");
    }

    #[test]
    fn test_file_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("volume.{EXTENSION}"));
        let volume = sample_volume();

        write_file(&path, &volume, false).unwrap();
        assert_eq!(read_file(&path).unwrap(), volume);
        assert_eq!(
            read_file(&dir.path().join("missing.mha")).unwrap_err().kind(),
            "resource"
        );
    }
}
