//! Script injection into the editor's root document

use axum::http::{header, HeaderMap, Method, StatusCode};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

const HEAD: &[u8] = b"<head>";
const INJECTED_HEAD: &[u8] = b"<head>\n<script src=\"sail.js\"></script>\n";

/// Only the document root is rewritten, and never an upgrade.
pub fn should_rewrite(path: &str, upgrade: bool) -> bool {
    path == "/" && !upgrade
}

/// Only a full HTML page is rewritten; HEAD, redirects and 304s pass through.
pub fn is_rewritable_response(method: &Method, status: StatusCode, headers: &HeaderMap) -> bool {
    method != Method::HEAD
        && status == StatusCode::OK
        && headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with("text/html"))
}

/// Insert the sail script tag after the first `<head>`
pub fn inject_script(html: &[u8]) -> Vec<u8> {
    match html.windows(HEAD.len()).position(|w| w == HEAD) {
        Some(at) => {
            let mut out = Vec::with_capacity(html.len() + INJECTED_HEAD.len());
            out.extend_from_slice(&html[..at]);
            out.extend_from_slice(INJECTED_HEAD);
            out.extend_from_slice(&html[at + HEAD.len()..]);
            out
        }
        None => html.to_vec(),
    }
}

/// Rewrite a response body, decoding and re-encoding gzip when `gzipped`.
pub fn rewrite_body(body: &[u8], gzipped: bool) -> io::Result<Vec<u8>> {
    if !gzipped {
        return Ok(inject_script(body));
    }
    let mut html = Vec::new();
    GzDecoder::new(body).read_to_end(&mut html)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&inject_script(&html))?;
    encoder.finish()
}
