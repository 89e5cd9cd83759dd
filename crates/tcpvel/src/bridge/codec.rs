//! Framed JSON codec for the producer channel.
//!
//! LengthDelimitedCodec (4-byte big-endian prefix) for framing, serde_json for the
//! payload. Works over any AsyncRead/AsyncWrite.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames above this size are rejected; telemetry frames are a few hundred bytes.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Envelope, IncarnationId};

    #[test]
    fn frames_are_length_prefixed_json() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Envelope::Telemetry {
                    seq: 1,
                    payload: serde_json::json!({"type": "running_program", "program_name": "A"}),
                },
                &mut buf,
            )
            .unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        let body: serde_json::Value = serde_json::from_slice(&buf[4..]).unwrap();
        assert_eq!(body["kind"], "telemetry");
        assert_eq!(body["seq"], 1);
    }

    #[test]
    fn decodes_back_to_back_frames_in_order() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        let incarnation = IncarnationId::new();
        codec
            .encode(Envelope::Hello { incarnation, pid: 42 }, &mut buf)
            .unwrap();
        for seq in 0..3 {
            codec
                .encode(
                    Envelope::Telemetry {
                        seq,
                        payload: serde_json::json!(seq),
                    },
                    &mut buf,
                )
                .unwrap();
        }

        match codec.decode(&mut buf).unwrap().unwrap() {
            Envelope::Hello { incarnation: got, pid } => {
                assert_eq!(got, incarnation);
                assert_eq!(pid, 42);
            }
            other => panic!("expected hello, got {other:?}"),
        }
        for expected in 0..3 {
            match codec.decode(&mut buf).unwrap().unwrap() {
                Envelope::Telemetry { seq, .. } => assert_eq!(seq, expected),
                other => panic!("expected telemetry, got {other:?}"),
            }
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                Envelope::Telemetry {
                    seq: 9,
                    payload: serde_json::Value::Null,
                },
                &mut full,
            )
            .unwrap();

        let mut partial = full.split_to(full.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn invalid_json_is_invalid_data() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec()
            .encode(Bytes::from_static(b"{not json"), &mut buf)
            .unwrap();

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
