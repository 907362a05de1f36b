//! Normalization of the different header shapes into HAR [`Header`] lists.

use crate::spec::Header;
use http::{HeaderMap, HeaderName};
use indexmap::IndexMap;

/// The shapes in which headers can be handed to [`normalize_headers`].
///
/// Every shape keeps its own ordering: flat lists and index maps keep
/// insertion order, a [`HeaderMap`] yields names in insertion order
/// with all values of a name grouped together.
#[derive(Debug, Clone, Copy)]
pub enum RawHeaders<'a> {
    /// Alternating names and values: `[name, value, name, value, ...]`.
    ///
    /// A trailing name without value is ignored.
    Flat(&'a [String]),
    /// A map of name to all values for that name.
    Multi(&'a IndexMap<String, Vec<String>>),
    /// A map of name to a single value.
    Single(&'a IndexMap<String, String>),
    /// Headers as found on a request or response.
    Map(&'a HeaderMap),
}

/// Turn the given headers into an ordered list of HAR [`Header`]s,
/// keeping every value of a repeated name.
#[must_use]
pub fn normalize_headers(raw: RawHeaders<'_>) -> Vec<Header> {
    match raw {
        RawHeaders::Flat(list) => list
            .chunks_exact(2)
            .map(|pair| Header::new(pair[0].as_str(), pair[1].as_str()))
            .collect(),
        RawHeaders::Multi(map) => map
            .iter()
            .flat_map(|(name, values)| {
                values
                    .iter()
                    .map(move |value| Header::new(name.as_str(), value.as_str()))
            })
            .collect(),
        RawHeaders::Single(map) => map
            .iter()
            .map(|(name, value)| Header::new(name.as_str(), value.as_str()))
            .collect(),
        RawHeaders::Map(map) => header_map_to_list(map, None),
    }
}

/// Same as [`normalize_headers`] for a [`HeaderMap`],
/// but leaves out all values of the `excluded` header.
pub(crate) fn header_map_to_list(map: &HeaderMap, excluded: Option<&HeaderName>) -> Vec<Header> {
    let mut list = Vec::with_capacity(map.len());
    for name in map.keys() {
        if excluded == Some(name) {
            continue;
        }
        for value in map.get_all(name) {
            list.push(Header::new(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()),
            ));
        }
    }
    list
}

/// Iterate over all values of the header with the given name,
/// matched case-insensitively.
pub fn header_values<'a>(headers: &'a [Header], name: &'a str) -> impl Iterator<Item = &'a str> {
    headers
        .iter()
        .filter(move |header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

/// The first value of the header with the given name, matched case-insensitively.
#[must_use]
pub fn first_header_value<'a>(headers: &'a [Header], name: &'a str) -> Option<&'a str> {
    header_values(headers, name).next()
}
