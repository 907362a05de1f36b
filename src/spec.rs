//! HAR 1.2 data model.
//!
//! See <http://www.softwareishard.com/blog/har-12-spec/> for the upstream
//! definition. Fields that HAR marks optional are `Option`s and are skipped
//! when serializing.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Version of the HAR format produced by this crate.
pub const HAR_VERSION: &str = "1.2";

/// Id of the page that entries are attached to when no page reference is given.
pub const DEFAULT_PAGE_ID: &str = "page_1";

/// Value recorded as `_resourceType` for every captured entry.
pub const RESOURCE_TYPE_FETCH: &str = "fetch";

macro_rules! har_data {
    ($(#[$outer:meta])* $name:ident, { $($field:tt)* }) => {
        $(#[$outer])*
        #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            $($field)*
        }
    };
}

har_data!(
    /// Root of a HAR document: `{"log": {...}}`.
    Har, {
    pub log: Log,
});

har_data!(
    /// The exported data, see [`Har`].
    Log, {
    pub version: String,
    pub creator: Creator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<Browser>,
    #[serde(default)]
    pub pages: Vec<Page>,
    pub entries: Vec<Entry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(Creator, {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(Browser, {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(
    /// A page that groups entries, referenced by [`Entry::pageref`].
    Page, {
    pub started_date_time: String,
    pub id: String,
    pub title: String,
    pub page_timings: PageTimings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(PageTimings, {
    pub on_content_load: f64,
    pub on_load: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(
    /// One physical request/response exchange.
    Entry, {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pageref: Option<String>,
    pub started_date_time: String,
    pub time: f64,
    pub request: Request,
    pub response: Response,
    pub cache: Cache,
    pub timings: Timings,
    #[serde(
        rename = "serverIPAddress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub server_ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(
        rename = "_resourceType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(Request, {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub cookies: Vec<Cookie>,
    pub headers: Vec<Header>,
    pub query_string: Vec<QueryString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(Response, {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub cookies: Vec<Cookie>,
    pub headers: Vec<Header>,
    pub content: Content,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(
    /// A request cookie only carries `name` and `value`,
    /// response cookies also carry the `Set-Cookie` attributes.
    Cookie, {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(Header, {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

impl Header {
    /// Create a new [`Header`] without comment.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            comment: None,
        }
    }
}

har_data!(QueryString, {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(PostData, {
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<PostParam>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(PostParam, {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(Content, {
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(
    /// Cache usage is not observed by the tracer,
    /// both states are always `null`.
    Cache, {
    pub before_request: Option<CacheState>,
    pub after_request: Option<CacheState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

har_data!(CacheState, {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    pub last_access: String,
    pub e_tag: String,
    pub hit_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
});

/// Timing breakdown of an [`Entry`], in milliseconds.
///
/// `-1` marks a phase that does not apply to the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    pub blocked: f64,
    pub dns: f64,
    pub connect: f64,
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
    pub ssl: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            blocked: -1.0,
            dns: -1.0,
            connect: -1.0,
            send: 0.0,
            wait: 0.0,
            receive: 0.0,
            ssl: -1.0,
            comment: None,
        }
    }
}

impl Har {
    /// Create a new HAR document with a single default page
    /// and the given entries.
    #[must_use]
    pub fn new(entries: Vec<Entry>) -> Self {
        Self::with_page(entries, Page::default_page())
    }

    /// Create a new HAR document using the given page instead of the default one.
    #[must_use]
    pub fn with_page(entries: Vec<Entry>, page: Page) -> Self {
        Self {
            log: Log {
                version: HAR_VERSION.to_owned(),
                creator: Creator::default_creator(),
                browser: None,
                pages: vec![page],
                entries,
                comment: None,
            },
        }
    }
}

impl Creator {
    /// Creator describing this crate.
    #[must_use]
    pub fn default_creator() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            comment: None,
        }
    }
}

impl Page {
    /// The implicit page that entries belong to when no page reference is given,
    /// started now.
    #[must_use]
    pub fn default_page() -> Self {
        Self {
            started_date_time: format_timestamp(Timestamp::now()),
            id: DEFAULT_PAGE_ID.to_owned(),
            title: "Page".to_owned(),
            page_timings: PageTimings {
                on_content_load: -1.0,
                on_load: -1.0,
                comment: None,
            },
            comment: None,
        }
    }

    /// Override the page id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the page title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// Format a timestamp the way HAR expects it: ISO 8601, UTC, millisecond precision.
pub(crate) fn format_timestamp(ts: Timestamp) -> String {
    format!("{ts:.3}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_har_log_has_default_page() {
        let har = Har::new(vec![]);
        assert_eq!(har.log.version, "1.2");
        assert_eq!(har.log.creator.name, "rama-har");
        assert_eq!(har.log.pages.len(), 1);
        assert_eq!(har.log.pages[0].id, DEFAULT_PAGE_ID);
        assert_eq!(har.log.pages[0].title, "Page");
        assert!(har.log.entries.is_empty());
    }

    #[test]
    fn page_override() {
        let har = Har::with_page(
            vec![],
            Page::default_page().with_id("checkout").with_title("Checkout"),
        );
        assert_eq!(har.log.pages[0].id, "checkout");
        assert_eq!(har.log.pages[0].title, "Checkout");
    }

    #[test]
    fn serialized_field_names() {
        let mut entry = Entry::default();
        entry.response.redirect_url = "/next".to_owned();
        entry.server_ip_address = Some("127.0.0.1".to_owned());
        entry.resource_type = Some(RESOURCE_TYPE_FETCH.to_owned());

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["response"]["redirectURL"], "/next");
        assert_eq!(value["serverIPAddress"], "127.0.0.1");
        assert_eq!(value["_resourceType"], "fetch");
        assert!(value.get("startedDateTime").is_some());
        assert!(value["request"].get("postData").is_none());
        assert!(value["cache"]["beforeRequest"].is_null());
    }

    #[test]
    fn default_timings_mark_unknown_phases() {
        let timings = Timings::default();
        assert_eq!(timings.blocked, -1.0);
        assert_eq!(timings.dns, -1.0);
        assert_eq!(timings.connect, -1.0);
        assert_eq!(timings.ssl, -1.0);
        assert_eq!(timings.send, 0.0);
    }

    #[test]
    fn timestamp_has_millisecond_precision() {
        let ts: Timestamp = "2015-10-21T07:28:00Z".parse().unwrap();
        assert_eq!(format_timestamp(ts), "2015-10-21T07:28:00.000Z");
    }

    #[test]
    fn page_timings_serialize_camel_case() {
        let page = Page::default_page();
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(value["pageTimings"]["onContentLoad"], -1.0);
        assert_eq!(value["pageTimings"]["onLoad"], -1.0);
    }
}
