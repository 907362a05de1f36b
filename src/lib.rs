//! HAR capture for fetch-style http clients.
//!
//! `rama-har` records every request issued through a fetch-style rama
//! [`Service`](rama_core::Service) as a
//! [HAR 1.2](http://www.softwareishard.com/blog/har-12-spec/) entry: headers,
//! cookies, query string, posted data, response content and a timing
//! breakdown, without the caller changing how it issues requests.
//!
//! The moving parts:
//!
//! - [`HarFetch`], produced by the [`HarFetchLayer`], wraps a fetch service.
//!   It tags every call with a correlation token and finalizes the entries
//!   once the response body was read;
//! - [`HarTransport`], produced by the [`HarTransportLayer`], wraps a
//!   transport service and records each physical request (redirect hops
//!   included) that carries a token it knows about;
//! - the [`PendingEntryTable`] links both, and chains redirect hops;
//! - transports report connection milestones through the one-shot
//!   [`Lifecycle`](lifecycle::Lifecycle) hubs, from which the
//!   [timings](timing) are derived.
//!
//! Finalized entries end up in a [`SharedHarLog`], an
//! [`OnEntry`](recorder::OnEntry) callback, and the [`HarEntry`] extension
//! of the returned response.
//!
//! # Rama
//!
//! Learn more about `rama`:
//!
//! - Github: <https://github.com/plabayo/rama>
//! - Book: <https://ramaproxy.org/book/>
//!
//! [`HarFetch`]: fetch::HarFetch
//! [`HarFetchLayer`]: fetch::HarFetchLayer
//! [`HarEntry`]: fetch::HarEntry
//! [`HarTransport`]: transport::HarTransport
//! [`HarTransportLayer`]: transport::HarTransportLayer
//! [`PendingEntryTable`]: pending::PendingEntryTable
//! [`SharedHarLog`]: recorder::SharedHarLog

#![doc(
    html_favicon_url = "https://raw.githubusercontent.com/plabayo/rama/main/docs/img/old_logo.png"
)]
#![doc(html_logo_url = "https://raw.githubusercontent.com/plabayo/rama/main/docs/img/old_logo.png")]
#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]

pub mod body;
pub mod cookie;
pub mod entry;
pub mod fetch;
pub mod headers;
pub mod lifecycle;
pub mod pending;
pub mod recorder;
pub mod spec;
pub mod timing;
pub mod transport;

pub use fetch::{HarEntry, HarFetch, HarFetchLayer, HarOptions};
pub use recorder::SharedHarLog;
pub use spec::Har;
pub use transport::{Agent, BoxTransport, HarTransport, HarTransportLayer, Transport};
