//! Embedding Codec
//!
//! Raw vector bytes as handed to the metadata store: little-endian `f32`s,
//! bit-exact on round trip.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FaceError, Result};

/// Encode an embedding as little-endian `f32` bytes
pub fn encode_embedding(embedding: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(embedding.len() * 4);
    for value in embedding {
        buf.put_f32_le(*value);
    }
    buf.freeze()
}

/// Decode bytes produced by [`encode_embedding`]
pub fn decode_embedding(mut raw: &[u8]) -> Result<Vec<f32>> {
    if raw.len() % 4 != 0 {
        return Err(FaceError::Corrupt(format!(
            "embedding byte length {} is not a multiple of 4",
            raw.len()
        )));
    }

    let mut embedding = Vec::with_capacity(raw.len() / 4);
    while raw.has_remaining() {
        embedding.push(raw.get_f32_le());
    }
    Ok(embedding)
}
