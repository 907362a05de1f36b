//! Assemble HAR [`Entry`] records from http parts,
//! captured bodies and timings.

use crate::body::CapturedBody;
use crate::cookie::{parse_request_cookies, parse_response_cookies};
use crate::headers::{first_header_value, header_map_to_list};
use crate::spec::{
    Cache, Content, Entry, Header, QueryString, RESOURCE_TYPE_FETCH, Request, Response, Timings,
    format_timestamp,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http::{HeaderName, Uri, Version, request, response};
use jiff::Timestamp;
use rama_http_core::ext::ReasonPhrase;

/// Content codings for which the raw response size differs from the decoded size.
pub const COMPRESSED_ENCODINGS: [&str; 4] = ["gzip", "compress", "deflate", "br"];

/// Build the provisional entry for a request that is about to be dispatched.
///
/// The response part is left empty until the response head arrives,
/// see [`build_response`]. Values of the `excluded` header are not recorded.
#[must_use]
pub fn build_entry(parts: &request::Parts, excluded: Option<&HeaderName>) -> Entry {
    Entry {
        started_date_time: format_timestamp(Timestamp::now()),
        request: build_request(parts, excluded),
        cache: Cache::default(),
        timings: Timings::default(),
        resource_type: Some(RESOURCE_TYPE_FETCH.to_owned()),
        ..Default::default()
    }
}

/// Build the HAR request from the parts of a request.
///
/// `bodySize` starts out as `-1`, it is only set once a body was written,
/// see [`apply_captured_body`].
#[must_use]
pub fn build_request(parts: &request::Parts, excluded: Option<&HeaderName>) -> Request {
    let headers = header_map_to_list(&parts.headers, excluded);
    Request {
        method: parts.method.to_string(),
        url: parts.uri.to_string(),
        http_version: http_version_str(parts.version),
        cookies: parse_request_cookies(&headers),
        query_string: query_string(&parts.uri),
        headers,
        post_data: None,
        headers_size: -1,
        body_size: -1,
        comment: None,
    }
}

/// Build the HAR response from the parts of a response head.
///
/// The content is filled in once the body was consumed, see [`fill_content`].
#[must_use]
pub fn build_response(parts: &response::Parts) -> Response {
    let headers = header_map_to_list(&parts.headers, None);
    Response {
        status: parts.status.as_u16(),
        status_text: status_text(parts),
        http_version: http_version_str(parts.version),
        cookies: parse_response_cookies(&headers),
        content: Content {
            size: -1,
            mime_type: first_header_value(&headers, "content-type").map(str::to_owned),
            ..Default::default()
        },
        redirect_url: first_header_value(&headers, "location")
            .unwrap_or_default()
            .to_owned(),
        headers,
        headers_size: -1,
        body_size: -1,
        comment: None,
    }
}

/// The reason phrase as received, if the transport kept it, otherwise
/// the canonical reason of the status code.
fn status_text(parts: &response::Parts) -> String {
    match parts.extensions.get::<ReasonPhrase>() {
        Some(reason) => String::from_utf8_lossy(reason.as_bytes()).into_owned(),
        None => parts.status.canonical_reason().unwrap_or_default().to_owned(),
    }
}

/// Whether the response body is content-encoded with a coding in [`COMPRESSED_ENCODINGS`].
#[must_use]
pub fn is_compressed(headers: &[Header]) -> bool {
    first_header_value(headers, "content-encoding").is_some_and(|coding| {
        COMPRESSED_ENCODINGS
            .iter()
            .any(|known| coding.trim().eq_ignore_ascii_case(known))
    })
}

/// Record the request body, if one was written.
pub fn apply_captured_body(request: &mut Request, captured: Option<CapturedBody>) {
    if let Some(captured) = captured {
        request.body_size = i64::try_from(captured.size).unwrap_or(i64::MAX);
        request.post_data = captured.post_data;
    }
}

/// Record the decoded response body.
///
/// `raw_size` is the number of bytes received on the wire, if it was counted.
/// For a compressed response `compression` is only recorded when it was.
pub fn fill_content(
    response: &mut Response,
    body: &Bytes,
    raw_size: Option<u64>,
    compressed: bool,
) {
    let size = i64::try_from(body.len()).unwrap_or(i64::MAX);
    let content = &mut response.content;
    content.size = size;
    match std::str::from_utf8(body) {
        Ok(text) => {
            content.text = Some(text.to_owned());
            content.encoding = None;
        }
        Err(_) => {
            content.text = Some(BASE64.encode(body));
            content.encoding = Some("base64".to_owned());
        }
    }

    if compressed {
        if let Some(raw_size) = raw_size {
            let raw_size = i64::try_from(raw_size).unwrap_or(i64::MAX);
            content.compression = Some(size - raw_size);
            response.body_size = raw_size;
        }
    } else {
        response.body_size = size;
    }
}

/// The `HTTP/x.y` notation of a version, as recorded in HAR.
#[must_use]
pub fn http_version_str(version: Version) -> String {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        other => return format!("{other:?}"),
    }
    .to_owned()
}

fn query_string(uri: &Uri) -> Vec<QueryString> {
    let Some(query) = uri.query() else {
        return Vec::new();
    };
    match serde_html_form::from_str::<Vec<(String, String)>>(query) {
        Ok(pairs) => pairs
            .into_iter()
            .map(|(name, value)| QueryString {
                name,
                value,
                comment: None,
            })
            .collect(),
        Err(err) => {
            tracing::debug!("failed to parse query string '{query}', record none: {err}");
            Vec::new()
        }
    }
}
