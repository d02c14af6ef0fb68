//! Frame codec
//!
//! Converts between floating-point frames and the 16-bit PCM wire format,
//! and between raw PCM bytes and transport-safe base64 text. Both directions
//! are pure; the encoder/decoder structs only add statistics.

pub mod decoder;
pub mod encoder;

pub use decoder::{decode, DecoderStats, PcmDecoder};
pub use encoder::{encode, EncoderStats, PcmEncoder};
