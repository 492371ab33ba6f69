//! Frame encoding.
//!
//! A chunk travels as a single event frame: `data: <json>\n\n`. A heartbeat is
//! a comment frame, `: heartbeat\n\n`, which carries no payload and must be
//! ignored by parsers.

use axum::body::Bytes;

use crate::models::StreamChunk;

/// Prefix of a data line.
pub const DATA_PREFIX: &str = "data:";

/// Keep-alive comment frame.
const HEARTBEAT_FRAME: &[u8] = b": heartbeat\n\n";

/// Encode one chunk as a `data:` frame.
pub fn encode_chunk(chunk: &StreamChunk) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(chunk)?;
    Ok(Bytes::from(format!("{DATA_PREFIX} {json}\n\n")))
}

pub const fn heartbeat_frame() -> Bytes {
    Bytes::from_static(HEARTBEAT_FRAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_frame_layout() {
        let bytes = encode_chunk(&StreamChunk::text("Hi")).unwrap();
        assert_eq!(&bytes[..], b"data: {\"type\":\"text\",\"content\":\"Hi\"}\n\n");
    }

    #[test]
    fn heartbeat_is_a_comment() {
        let bytes = heartbeat_frame();
        assert_eq!(&bytes[..], b": heartbeat\n\n");
    }

    #[test]
    fn newlines_in_content_stay_on_one_line() {
        let bytes = encode_chunk(&StreamChunk::text("line one\nline two")).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert_eq!(text.matches('\n').count(), 2);
        assert!(text.ends_with("\n\n"));
    }
}
