//! Plaintext capture of intercepted HTTP exchanges.
//!
//! Each message becomes one log record: start line, every header on its
//! own line, the body decoded to UTF-8 (best effort), and any trailers.
//! To keep capture readable the client's Accept-Encoding is forced to
//! identity; responses an origin compresses anyway are decompressed before
//! logging.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder};
use tracing::info;

use crate::http::message::{Body, Headers, RequestHead, ResponseHead};

/// Rewrite the outgoing request so the origin answers in plaintext.
pub fn prepare_request(headers: &mut Headers) {
    headers.set("Accept-Encoding", "identity");
}

/// Decode a body for logging according to its Content-Encoding. Bytes that
/// fail to decompress are logged as they came.
fn decode_body(headers: &Headers, data: &[u8]) -> Vec<u8> {
    let encoding = headers
        .get("Content-Encoding")
        .unwrap_or("identity")
        .trim()
        .to_ascii_lowercase();
    let mut decoded = Vec::new();
    let ok = match encoding.as_str() {
        "gzip" | "x-gzip" => GzDecoder::new(data).read_to_end(&mut decoded).is_ok(),
        "deflate" => DeflateDecoder::new(data).read_to_end(&mut decoded).is_ok(),
        _ => false,
    };
    if ok {
        decoded
    } else {
        data.to_vec()
    }
}

fn render(start_line: &str, headers: &Headers, body: &[u8], trailers: &Headers) -> String {
    let mut record = String::with_capacity(256 + body.len());
    record.push_str(start_line);
    record.push('\n');
    for (name, value) in headers.iter() {
        record.push_str(name);
        record.push_str(": ");
        record.push_str(value);
        record.push('\n');
    }
    if !body.is_empty() {
        record.push('\n');
        record.push_str(&String::from_utf8_lossy(body));
        record.push('\n');
    }
    for (name, value) in trailers.iter() {
        record.push_str(name);
        record.push_str(": ");
        record.push_str(value);
        record.push('\n');
    }
    record
}

/// Emit the capture record for a request.
pub fn log_request(request: &RequestHead, body: &Body) {
    let decoded = decode_body(&request.headers, &body.data);
    let record = render(&request.start_line(), &request.headers, &decoded, &body.trailers);
    info!(target: "tapgate::capture", direction = "request", "{}", record);
}

/// Emit the capture record for a response, tagged with the request it
/// answers.
pub fn log_response(request: &RequestHead, response: &ResponseHead, body: &Body) {
    let decoded = decode_body(&response.headers, &body.data);
    let record = render(&response.start_line(), &response.headers, &decoded, &body.trailers);
    info!(
        target: "tapgate::capture",
        direction = "response",
        request = %request.start_line(),
        "{}",
        record
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_prepare_request_forces_identity() {
        let mut headers = Headers::new();
        headers.push("Accept-Encoding", "gzip, br");
        prepare_request(&mut headers);
        assert_eq!(headers.get("Accept-Encoding"), Some("identity"));
    }

    #[test]
    fn test_decode_gzip_body() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"plaintext payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = Headers::new();
        headers.push("Content-Encoding", "gzip");
        assert_eq!(decode_body(&headers, &compressed), b"plaintext payload");
    }

    #[test]
    fn test_decode_identity_passthrough() {
        let headers = Headers::new();
        assert_eq!(decode_body(&headers, b"as-is"), b"as-is");
    }

    #[test]
    fn test_decode_corrupt_gzip_falls_back() {
        let mut headers = Headers::new();
        headers.push("Content-Encoding", "gzip");
        assert_eq!(decode_body(&headers, b"not gzip"), b"not gzip");
    }

    #[test]
    fn test_render_record_shape() {
        let mut headers = Headers::new();
        headers.push("Host", "example.com");
        headers.push("Accept", "*/*");
        let mut trailers = Headers::new();
        trailers.push("X-Sum", "abc");

        let record = render("GET / HTTP/1.1", &headers, b"hello \xFF world", &trailers);
        let lines: Vec<&str> = record.lines().collect();
        assert_eq!(lines[0], "GET / HTTP/1.1");
        assert_eq!(lines[1], "Host: example.com");
        assert_eq!(lines[2], "Accept: */*");
        // Invalid UTF-8 still shows up, lossily
        assert!(lines[4].starts_with("hello"));
        assert_eq!(*lines.last().unwrap(), "X-Sum: abc");
    }

    #[test]
    fn test_render_without_body() {
        let record = render("HTTP/1.1 204 No Content", &Headers::new(), b"", &Headers::new());
        assert_eq!(record, "HTTP/1.1 204 No Content\n");
    }
}
