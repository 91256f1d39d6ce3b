//! Binary record format for [`HashChunk`].
//!
//! The layout is protobuf compatible:
//!
//! | tag | field       | wire type        | presence          |
//! |-----|-------------|------------------|-------------------|
//! | 1   | `path`      | fixed64          | omitted when 0    |
//! | 2   | `height`    | fixed32          | always            |
//! | 4   | `hash_data` | length-delimited | always            |

use prost::encoding::{self, wire_type::WireType};
use thiserror::Error as ThisError;

use crate::chunk::HashChunk;
use crate::error::VmapError;

const TAG_PATH: u32 = 1;
const TAG_HEIGHT: u32 = 2;
const TAG_HASH_DATA: u32 = 4;

const MAX_VARINT_LEN: usize = 10;

/// Failure to decode a chunk record.
#[derive(Debug, ThisError, Eq, PartialEq)]
#[non_exhaustive]
pub enum CodecError {
    #[error("unknown field tag {0}")]
    UnknownTag(u32),

    #[error("field {tag} has unexpected wire type {wire_type:?}")]
    UnexpectedWireType { tag: u32, wire_type: WireType },

    #[error("record ends in the middle of a field")]
    Truncated,

    #[error("varint is longer than 10 bytes")]
    VarintOverflow,

    #[error("required field `{0}` is missing")]
    MissingField(&'static str),

    #[error("malformed field key: {0}")]
    MalformedKey(String),
}

/// Fails with [`CodecError::Truncated`] when `input` stops inside a varint.
fn check_varint_complete(input: &[u8]) -> Result<(), CodecError> {
    if input.len() < MAX_VARINT_LEN && input.iter().all(|byte| byte & 0x80 != 0) {
        return Err(CodecError::Truncated);
    }

    Ok(())
}

fn decode_key(input: &mut &[u8]) -> Result<(u32, WireType), CodecError> {
    check_varint_complete(input)?;
    encoding::decode_key(input).map_err(|err| CodecError::MalformedKey(err.to_string()))
}

fn decode_varint(input: &mut &[u8]) -> Result<u64, CodecError> {
    check_varint_complete(input)?;
    encoding::decode_varint(input).map_err(|_| CodecError::VarintOverflow)
}

fn take<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    if input.len() < len {
        return Err(CodecError::Truncated);
    }

    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}

fn take_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], CodecError> {
    let mut bytes = [0; N];
    bytes.copy_from_slice(take(input, N)?);
    Ok(bytes)
}

/// Number of bytes [`encode`] produces for `chunk`.
#[must_use]
pub fn encoded_len(chunk: &HashChunk) -> usize {
    let path_len = if chunk.path() == 0 {
        0
    } else {
        encoding::fixed64::encoded_len(TAG_PATH, &chunk.path())
    };
    let data_len = chunk.hash_data().len();

    path_len
        + encoding::fixed32::encoded_len(TAG_HEIGHT, &chunk.height())
        + encoding::key_len(TAG_HASH_DATA)
        + encoding::encoded_len_varint(data_len as u64)
        + data_len
}

/// Serializes `chunk`.
#[must_use]
pub fn encode(chunk: &HashChunk) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(chunk));

    if chunk.path() != 0 {
        encoding::fixed64::encode(TAG_PATH, &chunk.path(), &mut buf);
    }

    encoding::fixed32::encode(TAG_HEIGHT, &chunk.height(), &mut buf);

    encoding::encode_key(TAG_HASH_DATA, WireType::LengthDelimited, &mut buf);
    encoding::encode_varint(chunk.hash_data().len() as u64, &mut buf);
    buf.extend_from_slice(chunk.hash_data());

    buf
}

/// Parses a chunk record, validating its shape and hash data length.
pub fn decode(bytes: &[u8]) -> Result<HashChunk, VmapError> {
    let mut input = bytes;

    let mut path = 0;
    let mut height = None;
    let mut hash_data = None;

    while !input.is_empty() {
        let (tag, wire_type) = decode_key(&mut input)?;

        match (tag, wire_type) {
            (TAG_PATH, WireType::SixtyFourBit) => {
                path = u64::from_le_bytes(take_array(&mut input)?);
            }
            (TAG_HEIGHT, WireType::ThirtyTwoBit) => {
                height = Some(u32::from_le_bytes(take_array(&mut input)?));
            }
            (TAG_HASH_DATA, WireType::LengthDelimited) => {
                let len = usize::try_from(decode_varint(&mut input)?)
                    .map_err(|_| CodecError::Truncated)?;
                hash_data = Some(take(&mut input, len)?.to_vec());
            }
            (TAG_PATH | TAG_HEIGHT | TAG_HASH_DATA, _) => {
                return Err(CodecError::UnexpectedWireType { tag, wire_type }.into());
            }
            _ => return Err(CodecError::UnknownTag(tag).into()),
        }
    }

    let height = height.ok_or(CodecError::MissingField("height"))?;
    let hash_data = hash_data.ok_or(CodecError::MissingField("hash_data"))?;

    HashChunk::from_parts(path, height, hash_data)
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;
    use crate::chunk::{chunk_size, DIGEST_LENGTH};

    fn random_chunk(path: u64, height: u32) -> HashChunk {
        let mut data = vec![0; DIGEST_LENGTH * chunk_size(height)];
        rand::thread_rng().fill_bytes(&mut data);
        HashChunk::from_parts(path, height, data).unwrap()
    }

    #[test]
    fn round_trip_root_chunk() {
        let chunk = random_chunk(0, 3);
        let bytes = encode(&chunk);

        assert_eq!(bytes.len(), encoded_len(&chunk));
        assert_eq!(bytes[0], 0x15, "path field must be omitted for path 0");
        assert_eq!(decode(&bytes).unwrap(), chunk);
    }

    #[test]
    fn round_trip_non_root_chunk() {
        let chunk = random_chunk(9, 3);
        let bytes = chunk.to_bytes();

        assert_eq!(bytes.len(), encoded_len(&chunk));
        assert_eq!(bytes[0], 0x09);
        assert_eq!(HashChunk::from_bytes(&bytes).unwrap(), chunk);
    }

    #[test]
    fn field_order_does_not_matter() {
        let chunk = random_chunk(3, 2);
        let mut bytes = Vec::new();

        encoding::encode_key(TAG_HASH_DATA, WireType::LengthDelimited, &mut bytes);
        encoding::encode_varint(chunk.hash_data().len() as u64, &mut bytes);
        bytes.extend_from_slice(chunk.hash_data());
        encoding::encode_key(TAG_HEIGHT, WireType::ThirtyTwoBit, &mut bytes);
        bytes.extend_from_slice(&2_u32.to_le_bytes());
        encoding::encode_key(TAG_PATH, WireType::SixtyFourBit, &mut bytes);
        bytes.extend_from_slice(&3_u64.to_le_bytes());

        assert_eq!(decode(&bytes).unwrap(), chunk);
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut bytes = encode(&random_chunk(0, 1));
        encoding::encode_key(3, WireType::Varint, &mut bytes);
        bytes.push(1);

        assert!(matches!(
            decode(&bytes),
            Err(VmapError::Codec(CodecError::UnknownTag(3)))
        ));
    }

    #[test]
    fn rejects_wrong_wire_type() {
        let mut bytes = Vec::new();
        encoding::encode_key(TAG_HEIGHT, WireType::Varint, &mut bytes);
        bytes.push(2);

        assert!(matches!(
            decode(&bytes),
            Err(VmapError::Codec(CodecError::UnexpectedWireType { tag: 2, .. }))
        ));
    }

    #[test]
    fn rejects_wrong_data_length() {
        let mut bytes = Vec::new();
        encoding::encode_key(TAG_HEIGHT, WireType::ThirtyTwoBit, &mut bytes);
        bytes.extend_from_slice(&2_u32.to_le_bytes());
        encoding::encode_key(TAG_HASH_DATA, WireType::LengthDelimited, &mut bytes);
        encoding::encode_varint(32, &mut bytes);
        bytes.extend_from_slice(&[7; 32]);

        assert!(matches!(decode(&bytes), Err(VmapError::InvalidArgument(_))));
    }

    #[test]
    fn rejects_truncated_and_incomplete_records() {
        let bytes = encode(&random_chunk(5, 2));

        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(VmapError::Codec(CodecError::Truncated))
        ));

        let mut only_height = Vec::new();
        encoding::encode_key(TAG_HEIGHT, WireType::ThirtyTwoBit, &mut only_height);
        only_height.extend_from_slice(&2_u32.to_le_bytes());

        assert!(matches!(
            decode(&only_height),
            Err(VmapError::Codec(CodecError::MissingField("hash_data")))
        ));
    }

    #[test]
    fn rejects_path_height_mismatch() {
        let chunk = random_chunk(0, 2);
        let mut bytes = Vec::new();
        encoding::encode_key(TAG_PATH, WireType::SixtyFourBit, &mut bytes);
        bytes.extend_from_slice(&1_u64.to_le_bytes());
        bytes.extend_from_slice(&encode(&chunk));

        assert!(matches!(decode(&bytes), Err(VmapError::InvalidArgument(_))));
    }

    #[test]
    fn rejects_malformed_varints() {
        assert!(matches!(
            decode(&[0x80, 0x80]),
            Err(VmapError::Codec(CodecError::Truncated))
        ));

        // wire type 7 does not exist
        assert!(matches!(
            decode(&[0x17]),
            Err(VmapError::Codec(CodecError::MalformedKey(_)))
        ));

        let mut bytes = Vec::new();
        encoding::encode_key(TAG_HASH_DATA, WireType::LengthDelimited, &mut bytes);
        bytes.extend_from_slice(&[0xff; MAX_VARINT_LEN]);
        bytes.push(0x01);

        assert!(matches!(
            decode(&bytes),
            Err(VmapError::Codec(CodecError::VarintOverflow))
        ));
    }
}
