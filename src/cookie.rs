//! Parse `Cookie` and `Set-Cookie` headers into HAR [`Cookie`]s.
//!
//! Parsing never fails: pairs and `Set-Cookie` values that cannot be
//! understood are skipped, the remainder is still returned.

use crate::headers::header_values;
use crate::spec::{Cookie, Header, format_timestamp};
use jiff::Timestamp;
use percent_encoding::percent_decode_str;

/// Parse all `Cookie` request headers (name matched case-insensitively)
/// into `name`/`value` cookies.
///
/// Within a single header the first occurrence of a name wins.
#[must_use]
pub fn parse_request_cookies(headers: &[Header]) -> Vec<Cookie> {
    let mut cookies = Vec::new();
    for value in header_values(headers, "cookie") {
        let start = cookies.len();
        for pair in value.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() || cookies[start..].iter().any(|c: &Cookie| c.name == name) {
                continue;
            }
            cookies.push(Cookie {
                name: name.to_owned(),
                value: decode_value(value.trim()),
                ..Default::default()
            });
        }
    }
    cookies
}

/// Parse all `Set-Cookie` response headers into full HAR cookies.
///
/// A malformed `Set-Cookie` value is skipped without affecting the others.
#[must_use]
pub fn parse_response_cookies(headers: &[Header]) -> Vec<Cookie> {
    header_values(headers, "set-cookie")
        .filter_map(|value| {
            let cookie = parse_set_cookie(value);
            if cookie.is_none() {
                tracing::trace!("skip malformed set-cookie header value: {value}");
            }
            cookie
        })
        .collect()
}

fn parse_set_cookie(header: &str) -> Option<Cookie> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = Cookie {
        name: name.to_owned(),
        value: decode_value(value.trim()),
        http_only: Some(false),
        secure: Some(false),
        ..Default::default()
    };

    for attribute in parts {
        let (key, value) = match attribute.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (attribute.trim(), ""),
        };
        if key.eq_ignore_ascii_case("path") {
            if !value.is_empty() {
                cookie.path = Some(value.to_owned());
            }
        } else if key.eq_ignore_ascii_case("domain") {
            if !value.is_empty() {
                cookie.domain = Some(value.to_owned());
            }
        } else if key.eq_ignore_ascii_case("expires") {
            cookie.expires = parse_expires(value);
        } else if key.eq_ignore_ascii_case("httponly") {
            cookie.http_only = Some(true);
        } else if key.eq_ignore_ascii_case("secure") {
            cookie.secure = Some(true);
        }
    }

    Some(cookie)
}

fn parse_expires(value: &str) -> Option<String> {
    let time = httpdate::parse_http_date(value)
        .inspect_err(|err| tracing::trace!("ignore cookie expires value '{value}': {err}"))
        .ok()?;
    let ts = Timestamp::try_from(time)
        .inspect_err(|err| tracing::trace!("cookie expires value '{value}' out of range: {err}"))
        .ok()?;
    Some(format_timestamp(ts))
}

fn decode_value(raw: &str) -> String {
    let raw = raw
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(raw);
    match percent_decode_str(raw).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_owned(),
    }
}
