//! Framed decode of a batched-loose-objects response body.
//!
//! The bulk endpoint can answer a multi-object request with one framed
//! stream instead of a pack. The layout is self-describing:
//!
//! ```text
//! u8 version            (currently 1)
//! repeat:
//!   u8  oid_len         20 | 32; 0 terminates the stream
//!   oid_len bytes       raw object id
//!   u64 LE              payload length
//!   payload bytes       loose-object content, as stored on disk
//! ```
//!
//! The decoder streams records to a callback without buffering the whole
//! response; a record's payload is the only per-record allocation.

use std::io::Read;

use crate::object_id::OidBytes;

use super::errors::FrameError;

/// Version this client can decode.
const FRAME_VERSION: u8 = 1;

/// Decodes a batched stream, invoking `sink` once per object.
///
/// Returns the number of objects delivered. Stops at the terminator record;
/// bytes after it are the caller's concern (there should be none).
///
/// # Errors
/// Fails on I/O errors, unknown versions, invalid id lengths, and streams
/// that end mid-record. Errors from `sink` abort the decode.
pub fn decode_batched_objects<R, F>(mut reader: R, mut sink: F) -> Result<u64, FrameError>
where
    R: Read,
    F: FnMut(OidBytes, Vec<u8>) -> Result<(), FrameError>,
{
    let version = read_u8(&mut reader)?.ok_or(FrameError::Truncated)?;
    if version != FRAME_VERSION {
        return Err(FrameError::UnsupportedVersion { version });
    }

    let mut delivered = 0u64;
    loop {
        let oid_len = read_u8(&mut reader)?.ok_or(FrameError::Truncated)?;
        if oid_len == 0 {
            return Ok(delivered);
        }
        if oid_len != OidBytes::SHA1_LEN && oid_len != OidBytes::SHA256_LEN {
            return Err(FrameError::InvalidOidLength { len: oid_len });
        }

        let mut oid_buf = [0u8; OidBytes::MAX_LEN as usize];
        read_exact_or_truncated(&mut reader, &mut oid_buf[..oid_len as usize])?;
        let oid = OidBytes::try_from_slice(&oid_buf[..oid_len as usize])
            .ok_or(FrameError::InvalidOidLength { len: oid_len })?;

        let mut len_buf = [0u8; 8];
        read_exact_or_truncated(&mut reader, &mut len_buf)?;
        let payload_len = u64::from_le_bytes(len_buf);

        let mut payload = Vec::new();
        let read = reader
            .by_ref()
            .take(payload_len)
            .read_to_end(&mut payload)?;
        if read as u64 != payload_len {
            return Err(FrameError::Truncated);
        }

        sink(oid, payload)?;
        delivered += 1;
    }
}

fn read_u8(reader: &mut impl Read) -> Result<Option<u8>, FrameError> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
}

fn read_exact_or_truncated(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), FrameError> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(err)
        }
    })
}

/// Encodes records into the framed layout.
///
/// The client never uploads objects; this exists for cache servers built on
/// the same crate and for test fixtures.
pub fn encode_batched_objects(records: &[(OidBytes, Vec<u8>)]) -> Vec<u8> {
    let mut out = vec![FRAME_VERSION];
    for (oid, payload) in records {
        out.push(oid.len());
        out.extend_from_slice(oid.as_slice());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(payload);
    }
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_round_trip() {
        let records = vec![
            (OidBytes::sha1([0x11; 20]), b"first".to_vec()),
            (OidBytes::sha256([0x22; 32]), b"second body".to_vec()),
            (OidBytes::sha1([0x33; 20]), Vec::new()),
        ];
        let encoded = encode_batched_objects(&records);

        let mut seen = Vec::new();
        let count = decode_batched_objects(encoded.as_slice(), |oid, payload| {
            seen.push((oid, payload));
            Ok(())
        })
        .unwrap();

        assert_eq!(count, 3);
        assert_eq!(seen, records);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let body = [9u8, 0u8];
        let err = decode_batched_objects(&body[..], |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedVersion { version: 9 }));
    }

    #[test]
    fn decode_rejects_bad_oid_len() {
        let body = [FRAME_VERSION, 7];
        let err = decode_batched_objects(&body[..], |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, FrameError::InvalidOidLength { len: 7 }));
    }

    #[test]
    fn decode_detects_truncated_payload() {
        let records = vec![(OidBytes::sha1([0xaa; 20]), b"payload".to_vec())];
        let mut encoded = encode_batched_objects(&records);
        encoded.truncate(encoded.len() - 4);

        let err = decode_batched_objects(encoded.as_slice(), |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }

    #[test]
    fn sink_error_aborts_decode() {
        let records = vec![
            (OidBytes::sha1([0x01; 20]), b"a".to_vec()),
            (OidBytes::sha1([0x02; 20]), b"b".to_vec()),
        ];
        let encoded = encode_batched_objects(&records);

        let mut calls = 0;
        let err = decode_batched_objects(encoded.as_slice(), |_, _| {
            calls += 1;
            Err(FrameError::Truncated)
        })
        .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, FrameError::Truncated));
    }
}
