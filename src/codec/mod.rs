//! Volumetric container codec

pub mod metaimage;

pub use metaimage::{
    decode, decode_with_limit, encode, read_file, read_file_with_limit, write_file, EXTENSION,
};
