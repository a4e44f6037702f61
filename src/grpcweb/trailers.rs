//! Trailer block text format: one `Key: Value\r\n` line per entry.

use bytes::{BufMut, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};

use super::error::{FrameError, Result};

const LINE_END: &[u8] = b"\r\n";
const SEPARATOR: &[u8] = b": ";

/// Serialize a trailer map. Multi-valued keys produce one line per value.
pub fn encode_trailer_block(trailers: &HeaderMap) -> BytesMut {
    let mut out = BytesMut::new();
    for (name, value) in trailers {
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(SEPARATOR);
        out.put_slice(value.as_bytes());
        out.put_slice(LINE_END);
    }
    out
}

/// Parse a trailer block, splitting each line on the first `": "`.
pub fn parse_trailer_block(block: &[u8]) -> Result<HeaderMap> {
    let mut trailers = HeaderMap::new();
    for line in split_lines(block) {
        if line.is_empty() {
            continue;
        }
        let Some(pos) = line.windows(SEPARATOR.len()).position(|w| w == SEPARATOR) else {
            return Err(malformed(line));
        };
        let key = line[..pos].to_ascii_lowercase();
        let name = HeaderName::from_bytes(&key).map_err(|_| malformed(line))?;
        let value = HeaderValue::from_bytes(&line[pos + SEPARATOR.len()..])
            .map_err(|_| malformed(line))?;
        trailers.append(name, value);
    }
    Ok(trailers)
}

fn split_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = block;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match rest.windows(LINE_END.len()).position(|w| w == LINE_END) {
            Some(pos) => {
                let line = &rest[..pos];
                rest = &rest[pos + LINE_END.len()..];
                Some(line)
            }
            None => {
                let line = rest;
                rest = &[];
                Some(line)
            }
        }
    })
}

fn malformed(line: &[u8]) -> FrameError {
    FrameError::MalformedTrailer(String::from_utf8_lossy(line).into_owned())
}
