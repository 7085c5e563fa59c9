//! HTTP response serialization.
//!
//! A cache entry is the HTTP/1.1 wire form of the response behind a fixed
//! magic prefix:
//!
//! ```text
//! ---HTTP-RESPONSE---\n
//! HTTP/1.1 200 OK\r\n
//! content-type: application/json\r\n
//! content-length: 5\r\n
//! \r\n
//! hello
//! ```
//!
//! Using the wire format itself keeps cache files human-readable and lets
//! other tools parse them after stripping the prefix; the prefix anchors
//! format versioning. Decoding validates the whole entry, so torn writes
//! surface as [`CacheError::Corrupt`] and become misses.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Response, StatusCode};

use crate::error::CacheError;

/// Magic prefix marking a serialized HTTP response.
pub const MAGIC: &[u8] = b"---HTTP-RESPONSE---\n";

const MAX_HEADERS: usize = 100;

/// Serializes a response into the magic-prefixed wire format.
///
/// The body is already fully buffered; a `content-length` header matching
/// it exactly is written in place of whatever the upstream sent, and any
/// `transfer-encoding` is dropped since the body is stored decoded.
pub fn encode(resp: &Response<Bytes>) -> Vec<u8> {
    let body = resp.body();
    let status = resp.status();

    let mut out = Vec::with_capacity(MAGIC.len() + 256 + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );

    for (name, value) in resp.headers() {
        if name == &CONTENT_LENGTH || name == &TRANSFER_ENCODING {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Deserializes a cache entry back into a response.
///
/// Any deviation - wrong prefix, unparseable status line or headers, a
/// body shorter than its declared length - is a [`CacheError::Corrupt`].
pub fn decode(data: &[u8]) -> Result<Response<Bytes>, CacheError> {
    let wire = data
        .strip_prefix(MAGIC)
        .ok_or_else(|| CacheError::Corrupt("missing magic prefix".into()))?;

    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_buf);
    let header_len = match parsed.parse(wire) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return Err(CacheError::Corrupt("truncated header block".into()))
        }
        Err(e) => return Err(CacheError::Corrupt(format!("malformed response: {e}"))),
    };

    let code = parsed
        .code
        .ok_or_else(|| CacheError::Corrupt("missing status code".into()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| CacheError::Corrupt(format!("invalid status code {code}")))?;

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    let mut content_length: Option<usize> = None;
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| CacheError::Corrupt(format!("invalid header name {:?}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| CacheError::Corrupt(format!("invalid value for header {}", h.name)))?;
        if name == CONTENT_LENGTH {
            let text = std::str::from_utf8(h.value)
                .map_err(|_| CacheError::Corrupt("non-ASCII content-length".into()))?;
            content_length = Some(
                text.trim()
                    .parse()
                    .map_err(|_| CacheError::Corrupt(format!("bad content-length {text:?}")))?,
            );
        }
        headers.append(name, value);
    }

    let raw_body = &wire[header_len..];
    let body = match content_length {
        Some(len) => {
            if raw_body.len() < len {
                return Err(CacheError::Corrupt(format!(
                    "body truncated: have {} bytes, content-length {}",
                    raw_body.len(),
                    len
                )));
            }
            Bytes::copy_from_slice(&raw_body[..len])
        }
        None => Bytes::copy_from_slice(raw_body),
    };

    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    Ok(resp)
}
