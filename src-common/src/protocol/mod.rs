//! Wire protocol between the decoding service and its clients.
//!
//! Hypothesis events travel as UTF-8 JSON. Stream and datagram transports
//! prefix each payload with a big-endian `u16` length; simple text transports
//! terminate each payload with a newline instead.

mod events;

pub use events::HypothesisEvent;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 2;

/// Largest payload a 16-bit header can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Terminator for line-framed payloads.
pub const LINE_SEPARATOR: u8 = b'\n';

/// Default port of the HTTP upload / browser socket endpoint.
pub const DEFAULT_HTTP_PORT: u16 = 10000;
/// Default port of the persistent-stream (TCP) listener.
pub const DEFAULT_TCP_PORT: u16 = 10001;
/// Default port of the datagram (UDP) listener.
pub const DEFAULT_UDP_PORT: u16 = 10002;

/// Errors produced while encoding or decoding framed records.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("malformed length header: {0}")]
    MalformedLength(String),

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How records are delimited on a byte stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// 2-byte big-endian length header followed by the payload
    #[default]
    Length,
    /// Payload followed by a newline
    Line,
}

impl Framing {
    /// Encode a record into the bytes this framing puts on the wire.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, FramingError> {
        match self {
            Framing::Length => encode_frame(value),
            Framing::Line => encode_line(value),
        }
    }

    /// Write one record to `writer` and flush.
    pub async fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), FramingError>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let bytes = self.encode(value)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one record from `reader`. Returns `None` on a clean end of stream.
    pub async fn read<R, T>(&self, reader: &mut R) -> Result<Option<T>, FramingError>
    where
        R: AsyncBufRead + Unpin,
        T: DeserializeOwned,
    {
        match self {
            Framing::Length => read_frame(reader).await,
            Framing::Line => read_line_frame(reader).await,
        }
    }
}

/// Serialize a record to JSON, enforcing the payload cap.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, FramingError> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FramingError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(payload)
}

/// Decode a JSON payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FramingError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Encode `header || payload` for stream transports.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FramingError> {
    let payload = encode_payload(value)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Encode header and payload separately, for datagram paths that send them
/// as two sequential writes.
pub fn encode_datagrams<T: Serialize>(
    value: &T,
) -> Result<([u8; HEADER_LEN], Vec<u8>), FramingError> {
    let payload = encode_payload(value)?;
    Ok(((payload.len() as u16).to_be_bytes(), payload))
}

/// Encode `payload || '\n'` for append-only text transports.
///
/// Compact JSON never contains a raw newline, so the separator is unambiguous.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, FramingError> {
    let mut bytes = encode_payload(value)?;
    bytes.push(LINE_SEPARATOR);
    Ok(bytes)
}

/// Parse a length header.
pub fn decode_header(header: &[u8]) -> Result<usize, FramingError> {
    let bytes: [u8; HEADER_LEN] = header.try_into().map_err(|_| {
        FramingError::MalformedLength(format!(
            "expected {} header bytes, got {}",
            HEADER_LEN,
            header.len()
        ))
    })?;
    let len = u16::from_be_bytes(bytes) as usize;
    if len == 0 {
        return Err(FramingError::MalformedLength("zero-length payload".into()));
    }
    Ok(len)
}

/// Decode one length-prefixed record from the front of `buf`.
///
/// Returns the record and the number of bytes consumed.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize), FramingError> {
    if buf.len() < HEADER_LEN {
        return Err(FramingError::Truncated {
            expected: HEADER_LEN,
            actual: buf.len(),
        });
    }
    let len = decode_header(&buf[..HEADER_LEN])?;
    let available = buf.len() - HEADER_LEN;
    if available < len {
        return Err(FramingError::Truncated {
            expected: len,
            actual: available,
        });
    }
    let value = decode_payload(&buf[HEADER_LEN..HEADER_LEN + len])?;
    Ok((value, HEADER_LEN + len))
}

/// Decode one line-framed record. A trailing separator is optional.
pub fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T, FramingError> {
    let payload = line.strip_suffix(&[LINE_SEPARATOR]).unwrap_or(line);
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FramingError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    decode_payload(payload)
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read one length-prefixed record. Returns `None` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FramingError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < HEADER_LEN {
        return Err(FramingError::Truncated {
            expected: HEADER_LEN,
            actual: got,
        });
    }

    let len = decode_header(&header)?;
    let mut payload = vec![0u8; len];
    let got = read_full(reader, &mut payload).await?;
    if got < len {
        return Err(FramingError::Truncated {
            expected: len,
            actual: got,
        });
    }
    decode_payload(&payload).map(Some)
}

/// Write one length-prefixed record and flush.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    Framing::Length.write(writer, value).await
}

/// Read one newline-terminated record. Returns `None` on a clean end of stream.
pub async fn read_line_frame<R, T>(reader: &mut R) -> Result<Option<T>, FramingError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(MAX_PAYLOAD_LEN as u64 + 1);
    limited.read_until(LINE_SEPARATOR, &mut line).await?;

    if line.is_empty() {
        return Ok(None);
    }
    if line.last() != Some(&LINE_SEPARATOR) {
        if line.len() > MAX_PAYLOAD_LEN {
            return Err(FramingError::PayloadTooLarge {
                len: line.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        return Err(FramingError::Truncated {
            expected: line.len() + 1,
            actual: line.len(),
        });
    }
    decode_line(&line).map(Some)
}

/// Write one newline-terminated record and flush.
pub async fn write_line_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    Framing::Line.write(writer, value).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn frame_header_is_big_endian_length() {
        let event = HypothesisEvent::sentence("ala ma kota");
        let bytes = encode_frame(&event).unwrap();
        let payload = br#"{"sentence":"ala ma kota"}"#;
        assert_eq!(&bytes[..2], &(payload.len() as u16).to_be_bytes());
        assert_eq!(&bytes[2..], payload);
    }

    #[test]
    fn decode_frame_reports_consumed_bytes() {
        let event = HypothesisEvent::phrase(2, "dzień dobry");
        let mut bytes = encode_frame(&event).unwrap();
        let frame_len = bytes.len();
        bytes.extend_from_slice(b"trailing");

        let (decoded, consumed): (HypothesisEvent, usize) = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(consumed, frame_len);
    }

    #[test]
    fn oversized_payload_is_rejected_without_output() {
        let event = HypothesisEvent::sentence("x".repeat(MAX_PAYLOAD_LEN));
        match encode_frame(&event) {
            Err(FramingError::PayloadTooLarge { len, max }) => {
                assert!(len > max);
                assert_eq!(max, MAX_PAYLOAD_LEN);
            }
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
        assert!(matches!(
            encode_line(&event),
            Err(FramingError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn payload_at_capacity_still_fits() {
        // {"sentence":""} is 15 bytes of overhead
        let event = HypothesisEvent::sentence("y".repeat(MAX_PAYLOAD_LEN - 15));
        let bytes = encode_frame(&event).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + MAX_PAYLOAD_LEN);
        let (decoded, _): (HypothesisEvent, usize) = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let bytes = encode_frame(&HypothesisEvent::sentence("hello")).unwrap();
        let cut = &bytes[..bytes.len() - 1];
        assert!(matches!(
            decode_frame::<HypothesisEvent>(cut),
            Err(FramingError::Truncated { .. })
        ));
        assert!(matches!(
            decode_frame::<HypothesisEvent>(&bytes[..1]),
            Err(FramingError::Truncated { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn zero_length_header_is_malformed() {
        assert!(matches!(
            decode_frame::<HypothesisEvent>(&[0, 0]),
            Err(FramingError::MalformedLength(_))
        ));
    }

    #[test]
    fn invalid_json_is_rejected() {
        let mut bytes = vec![0, 3];
        bytes.extend_from_slice(b"{x}");
        assert!(matches!(
            decode_frame::<HypothesisEvent>(&bytes),
            Err(FramingError::InvalidJson(_))
        ));
        assert!(matches!(
            decode_line::<HypothesisEvent>(b"not json\n"),
            Err(FramingError::InvalidJson(_))
        ));
    }

    #[test]
    fn datagram_parts_match_stream_frame() {
        let event = HypothesisEvent::phrase(0, "test");
        let (header, payload) = encode_datagrams(&event).unwrap();
        let mut joined = header.to_vec();
        joined.extend_from_slice(&payload);
        assert_eq!(joined, encode_frame(&event).unwrap());
    }

    #[tokio::test]
    async fn stream_reader_yields_records_then_eof() {
        let first = HypothesisEvent::sentence("one");
        let second = HypothesisEvent::phrase(1, "two");
        let mut wire = Vec::new();
        write_frame(&mut wire, &first).await.unwrap();
        write_frame(&mut wire, &second).await.unwrap();

        let mut reader = BufReader::new(wire.as_slice());
        let a: Option<HypothesisEvent> = read_frame(&mut reader).await.unwrap();
        let b: Option<HypothesisEvent> = read_frame(&mut reader).await.unwrap();
        let end: Option<HypothesisEvent> = read_frame(&mut reader).await.unwrap();
        assert_eq!(a, Some(first));
        assert_eq!(b, Some(second));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn stream_reader_rejects_cut_frame() {
        let mut wire = encode_frame(&HypothesisEvent::sentence("cut short")).unwrap();
        wire.truncate(wire.len() - 3);
        let mut reader = wire.as_slice();
        let result: Result<Option<HypothesisEvent>, _> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(FramingError::Truncated { .. })));
    }

    #[tokio::test]
    async fn line_reader_handles_records_and_partial_tail() {
        let mut wire = Vec::new();
        write_line_frame(&mut wire, &HypothesisEvent::sentence("a")).await.unwrap();
        wire.extend_from_slice(br#"{"sentence":"b"#);

        let mut reader = BufReader::new(wire.as_slice());
        let first: Option<HypothesisEvent> = read_line_frame(&mut reader).await.unwrap();
        assert_eq!(first, Some(HypothesisEvent::sentence("a")));
        let second: Result<Option<HypothesisEvent>, _> = read_line_frame(&mut reader).await;
        assert!(matches!(second, Err(FramingError::Truncated { .. })));
    }

    #[tokio::test]
    async fn line_reader_caps_unterminated_input() {
        let wire = vec![b'a'; MAX_PAYLOAD_LEN + 10];
        let mut reader = BufReader::new(wire.as_slice());
        let result: Result<Option<HypothesisEvent>, _> = read_line_frame(&mut reader).await;
        assert!(matches!(result, Err(FramingError::PayloadTooLarge { .. })));
    }
}
