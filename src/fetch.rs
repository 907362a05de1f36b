//! Record fetch calls as HAR entries.
//!
//! [`HarFetch`] wraps a fetch service: a rama [`Service`] that sends a
//! request, follows redirects and returns the final response. Every call
//! reserves a correlation token, instruments the transports the call will
//! use and, once the response arrived, reads the response body to finalize
//! the HAR entries of the call (one per redirect hop).
//!
//! The wrapped fetch service finds the [`Agent`] to dispatch every hop
//! with in its [`Context`].
//!
//! # Example
//!
//! ```
//! use rama_har::body::{Body, full};
//! use rama_har::fetch::{HarEntry, HarFetchLayer};
//! use rama_har::recorder::SharedHarLog;
//! use rama_har::spec::Har;
//! use rama_har::transport::{Agent, Transport};
//! use rama_core::error::BoxError;
//! use rama_core::{Context, Layer, Service};
//! use http::{Request, Response};
//!
//! struct Echo;
//!
//! impl Service<(), Request<Body>> for Echo {
//!     type Response = Response<Body>;
//!     type Error = BoxError;
//!
//!     async fn serve(
//!         &self,
//!         _ctx: Context<()>,
//!         req: Request<Body>,
//!     ) -> Result<Self::Response, Self::Error> {
//!         Ok(Response::new(req.into_body()))
//!     }
//! }
//!
//! // a fetch service that never follows redirects
//! struct OneShot;
//!
//! impl Service<(), Request<Body>> for OneShot {
//!     type Response = Response<Body>;
//!     type Error = BoxError;
//!
//!     async fn serve(
//!         &self,
//!         ctx: Context<()>,
//!         req: Request<Body>,
//!     ) -> Result<Self::Response, Self::Error> {
//!         let transport = ctx
//!             .get::<Agent>()
//!             .and_then(|agent| agent.resolve(req.uri()))
//!             .ok_or("no transport")?;
//!         transport.serve(ctx, req).await
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), BoxError> {
//! let log = SharedHarLog::new(Har::new(Vec::new()));
//! let fetch = HarFetchLayer::new(|_| Transport::new(Echo))
//!     .with_har_log(log.clone())
//!     .layer(OneShot);
//!
//! let req = Request::post("http://example.com/echo")
//!     .header("content-type", "text/plain")
//!     .body(full("hello"))?;
//! let resp = fetch.serve(Context::default(), req).await?;
//!
//! let entry = resp.extensions().get::<HarEntry>().unwrap();
//! assert_eq!(entry.response.content.text.as_deref(), Some("hello"));
//! assert_eq!(log.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::body::{Body, ResponseTap, full};
use crate::entry::fill_content;
use crate::pending::{CORRELATION_HEADER, PendingEntryTable};
use crate::recorder::{OnEntry, SharedHarLog};
use crate::spec::{DEFAULT_PAGE_ID, Entry};
use crate::transport::{Agent, SharedTransports, Transport, TransportScheme};
use bytes::Bytes;
use http::{Request, Response, Uri, response};
use http_body_util::BodyExt;
use rama_core::error::BoxError;
use rama_core::{Context, Layer, Service};
use rama_error::{ErrorExt, OpaqueError};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

/// Whether and where the entries of a call are recorded.
#[derive(Debug, Clone, Default)]
pub enum HarMode {
    /// Record entries, handing them to the entry callback only.
    #[default]
    Enabled,
    /// Do not trace the call at all.
    Disabled,
    /// Record entries and append them into the given log.
    AppendTo(SharedHarLog),
}

/// Rebuilds the response returned to the caller from the original
/// response head and the consumed body.
pub type ResponseBuilder = Arc<dyn Fn(response::Parts, Bytes) -> Response<Body> + Send + Sync>;

/// Options for a single call, overriding the [`HarFetch`] defaults.
///
/// Pass them as a request extension.
#[derive(Clone, Default)]
pub struct HarOptions {
    mode: Option<HarMode>,
    page_ref: Option<String>,
    on_entry: Option<Arc<dyn OnEntry>>,
    agent: Option<Agent>,
}

impl HarOptions {
    /// Create new options that override nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the entries of this call into the given log.
    #[must_use]
    pub fn with_har_log(mut self, log: SharedHarLog) -> Self {
        self.mode = Some(HarMode::AppendTo(log));
        self
    }

    /// Trace this call, handing its entries to the entry callback only.
    ///
    /// Overrides a [`HarFetch`] that has tracing disabled or appends into a log.
    #[must_use]
    pub fn enabled(mut self) -> Self {
        self.mode = Some(HarMode::Enabled);
        self
    }

    /// Do not trace this call.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.mode = Some(HarMode::Disabled);
        self
    }

    /// Attach the entries of this call to the given page.
    #[must_use]
    pub fn with_page_ref(mut self, page_ref: impl Into<String>) -> Self {
        self.page_ref = Some(page_ref.into());
        self
    }

    /// Hand every entry of this call to the given callback.
    #[must_use]
    pub fn with_on_entry(mut self, on_entry: impl OnEntry) -> Self {
        self.on_entry = Some(Arc::new(on_entry));
        self
    }

    /// Dispatch every hop of this call with the given transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.agent = Some(Agent::transport(transport));
        self
    }

    /// Ask the factory for the transport of every hop of this call.
    #[must_use]
    pub fn with_transport_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Uri) -> Option<Transport> + Send + Sync + 'static,
    {
        self.agent = Some(Agent::factory(factory));
        self
    }
}

impl fmt::Debug for HarOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarOptions")
            .field("mode", &self.mode)
            .field("page_ref", &self.page_ref)
            .field("on_entry", &self.on_entry.is_some())
            .field("agent", &self.agent)
            .finish()
    }
}

/// Response extension referring to the HAR entry of the final hop.
#[derive(Debug, Clone, PartialEq)]
pub struct HarEntry(pub Entry);

impl Deref for HarEntry {
    type Target = Entry;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A [`Layer`] that produces [`HarFetch`] services.
///
/// All services produced by the same layer share its [`PendingEntryTable`]
/// and its default transports.
#[derive(Clone)]
pub struct HarFetchLayer {
    table: PendingEntryTable,
    defaults: Arc<SharedTransports>,
    mode: HarMode,
    page_ref: Option<String>,
    on_entry: Option<Arc<dyn OnEntry>>,
    response_builder: Option<ResponseBuilder>,
}

impl HarFetchLayer {
    /// Create a new [`HarFetchLayer`].
    ///
    /// Calls that do not bring their own transport use a default one per
    /// scheme, created on first use with `make_default_transport`.
    pub fn new<M>(make_default_transport: M) -> Self
    where
        M: Fn(TransportScheme) -> Transport + Send + Sync + 'static,
    {
        let table = PendingEntryTable::new();
        Self {
            defaults: Arc::new(SharedTransports::new(
                Arc::new(make_default_transport),
                table.clone(),
            )),
            table,
            mode: HarMode::Enabled,
            page_ref: None,
            on_entry: None,
            response_builder: None,
        }
    }

    /// Append all entries into the given log.
    #[must_use]
    pub fn with_har_log(mut self, log: SharedHarLog) -> Self {
        self.mode = HarMode::AppendTo(log);
        self
    }

    /// Append all entries into the given log.
    pub fn set_har_log(&mut self, log: SharedHarLog) -> &mut Self {
        self.mode = HarMode::AppendTo(log);
        self
    }

    /// Do not trace calls, unless a call enables it in its [`HarOptions`].
    #[must_use]
    pub fn with_har_disabled(mut self) -> Self {
        self.mode = HarMode::Disabled;
        self
    }

    /// Do not trace calls, unless a call enables it in its [`HarOptions`].
    pub fn set_har_disabled(&mut self) -> &mut Self {
        self.mode = HarMode::Disabled;
        self
    }

    /// Attach entries to the given page, instead of [`DEFAULT_PAGE_ID`].
    #[must_use]
    pub fn with_page_ref(mut self, page_ref: impl Into<String>) -> Self {
        self.page_ref = Some(page_ref.into());
        self
    }

    /// Attach entries to the given page, instead of [`DEFAULT_PAGE_ID`].
    pub fn set_page_ref(&mut self, page_ref: impl Into<String>) -> &mut Self {
        self.page_ref = Some(page_ref.into());
        self
    }

    /// Hand every finalized entry to the given callback.
    #[must_use]
    pub fn with_on_entry(mut self, on_entry: impl OnEntry) -> Self {
        self.on_entry = Some(Arc::new(on_entry));
        self
    }

    /// Hand every finalized entry to the given callback.
    pub fn set_on_entry(&mut self, on_entry: impl OnEntry) -> &mut Self {
        self.on_entry = Some(Arc::new(on_entry));
        self
    }

    /// Rebuild the responses returned to the caller with the given function.
    #[must_use]
    pub fn with_response_builder<B>(mut self, builder: B) -> Self
    where
        B: Fn(response::Parts, Bytes) -> Response<Body> + Send + Sync + 'static,
    {
        self.response_builder = Some(Arc::new(builder));
        self
    }

    /// Rebuild the responses returned to the caller with the given function.
    pub fn set_response_builder<B>(&mut self, builder: B) -> &mut Self
    where
        B: Fn(response::Parts, Bytes) -> Response<Body> + Send + Sync + 'static,
    {
        self.response_builder = Some(Arc::new(builder));
        self
    }

    /// Record into the given table instead of a private one.
    ///
    /// Resets the shared default transports.
    #[must_use]
    pub fn with_pending_table(mut self, table: PendingEntryTable) -> Self {
        self.set_pending_table(table);
        self
    }

    /// Record into the given table instead of a private one.
    ///
    /// Resets the shared default transports.
    pub fn set_pending_table(&mut self, table: PendingEntryTable) -> &mut Self {
        self.defaults = Arc::new(SharedTransports::new(
            self.defaults.make_transport().clone(),
            table.clone(),
        ));
        self.table = table;
        self
    }
}

impl fmt::Debug for HarFetchLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarFetchLayer")
            .field("table", &self.table)
            .field("defaults", &self.defaults)
            .field("mode", &self.mode)
            .field("page_ref", &self.page_ref)
            .field("on_entry", &self.on_entry.is_some())
            .field("response_builder", &self.response_builder.is_some())
            .finish()
    }
}

impl<F> Layer<F> for HarFetchLayer {
    type Service = HarFetch<F>;

    fn layer(&self, inner: F) -> Self::Service {
        HarFetch {
            inner,
            table: self.table.clone(),
            defaults: self.defaults.clone(),
            mode: self.mode.clone(),
            page_ref: self.page_ref.clone(),
            on_entry: self.on_entry.clone(),
            response_builder: self.response_builder.clone(),
        }
    }
}

/// Fetch service wrapper recording every call as HAR entries.
///
/// Created with a [`HarFetchLayer`].
pub struct HarFetch<F> {
    inner: F,
    table: PendingEntryTable,
    defaults: Arc<SharedTransports>,
    mode: HarMode,
    page_ref: Option<String>,
    on_entry: Option<Arc<dyn OnEntry>>,
    response_builder: Option<ResponseBuilder>,
}

impl<F> HarFetch<F> {
    /// Wrap the given fetch service with the defaults of [`HarFetchLayer::new`].
    pub fn new<M>(inner: F, make_default_transport: M) -> Self
    where
        M: Fn(TransportScheme) -> Transport + Send + Sync + 'static,
    {
        HarFetchLayer::new(make_default_transport).layer(inner)
    }

    /// The table in which calls in progress are recorded.
    pub fn pending_table(&self) -> &PendingEntryTable {
        &self.table
    }

    /// The shared default transports.
    pub fn default_transports(&self) -> &Arc<SharedTransports> {
        &self.defaults
    }

    /// Reference to the wrapped fetch service.
    pub fn get_ref(&self) -> &F {
        &self.inner
    }

    /// Consumes `self`, returning the wrapped fetch service.
    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: fmt::Debug> fmt::Debug for HarFetch<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarFetch")
            .field("inner", &self.inner)
            .field("table", &self.table)
            .field("defaults", &self.defaults)
            .field("mode", &self.mode)
            .field("page_ref", &self.page_ref)
            .field("on_entry", &self.on_entry.is_some())
            .field("response_builder", &self.response_builder.is_some())
            .finish()
    }
}

impl<F: Clone> Clone for HarFetch<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            table: self.table.clone(),
            defaults: self.defaults.clone(),
            mode: self.mode.clone(),
            page_ref: self.page_ref.clone(),
            on_entry: self.on_entry.clone(),
            response_builder: self.response_builder.clone(),
        }
    }
}

impl<State, F> Service<State, Request<Body>> for HarFetch<F>
where
    State: Clone + Send + Sync + 'static,
    F: Service<State, Request<Body>, Response = Response<Body>, Error = BoxError>,
{
    type Response = Response<Body>;
    type Error = BoxError;

    async fn serve(
        &self,
        mut ctx: Context<State>,
        mut req: Request<Body>,
    ) -> Result<Self::Response, Self::Error> {
        let options = req
            .extensions_mut()
            .remove::<HarOptions>()
            .unwrap_or_default();
        let mode = options.mode.unwrap_or_else(|| self.mode.clone());
        let agent = options.agent.or_else(|| ctx.get::<Agent>().cloned());

        if matches!(mode, HarMode::Disabled) {
            tracing::trace!("HAR disabled for fetch {} {}", req.method(), req.uri());
            ctx.insert(agent.unwrap_or_else(|| Agent::shared_default(&self.defaults)));
            return self.inner.serve(ctx, req).await;
        }

        let guard = self.table.reserve();
        match guard.token().to_header_value() {
            Ok(value) => {
                req.headers_mut().insert(CORRELATION_HEADER.clone(), value);
            }
            Err(err) => {
                tracing::debug!("failed to encode HAR correlation token, fetch untraced: {err}");
                drop(guard);
                ctx.insert(agent.unwrap_or_else(|| Agent::shared_default(&self.defaults)));
                return self.inner.serve(ctx, req).await;
            }
        }

        ctx.insert(match agent {
            Some(agent) => agent.instrumented(&self.defaults),
            None => Agent::shared_default(&self.defaults),
        });

        // the guard releases the pending slot if this fails or is cancelled
        let response = self.inner.serve(ctx, req).await?;

        let Some(pending) = guard.complete() else {
            tracing::debug!("no request was recorded for this fetch, response returned untraced");
            return Ok(response);
        };

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|err| {
                OpaqueError::from_boxed(err).context("collect response body for HAR entry")
            })?
            .to_bytes();
        let body_received = Instant::now();

        {
            let mut state = pending.state.lock();
            let raw_size = state.tap.take().as_ref().and_then(ResponseTap::raw_bytes);
            let compressed = state.compressed;
            fill_content(&mut state.entry.response, &body, raw_size, compressed);
            state.finalize(Some(body_received));
        }

        let mut entries = pending.flatten();
        let page_ref = options
            .page_ref
            .or_else(|| self.page_ref.clone())
            .unwrap_or_else(|| DEFAULT_PAGE_ID.to_owned());
        for entry in &mut entries {
            entry.pageref = Some(page_ref.clone());
        }

        if let HarMode::AppendTo(log) = &mode {
            log.append(entries.iter().cloned());
        }
        if let Some(on_entry) = options.on_entry.as_ref().or(self.on_entry.as_ref()) {
            for entry in &entries {
                on_entry.on_entry(entry);
            }
        }
        tracing::debug!("finalized {} HAR entries for page {page_ref}", entries.len());

        let mut response = match &self.response_builder {
            Some(builder) => builder(parts, body),
            None => Response::from_parts(parts, full(body)),
        };
        if let Some(entry) = entries.pop() {
            response.extensions_mut().insert(HarEntry(entry));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Har;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    #[derive(Debug, Clone, Default)]
    struct Counting {
        dispatched: Arc<AtomicUsize>,
        saw_token: Arc<AtomicUsize>,
    }

    impl Service<(), Request<Body>> for Counting {
        type Response = Response<Body>;
        type Error = BoxError;

        async fn serve(
            &self,
            _ctx: Context<()>,
            req: Request<Body>,
        ) -> Result<Self::Response, Self::Error> {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            if req.headers().contains_key(&CORRELATION_HEADER) {
                self.saw_token.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Response::builder()
                .header("x-served-by", "counting")
                .body(full("ok"))?)
        }
    }

    struct OneShot;

    impl Service<(), Request<Body>> for OneShot {
        type Response = Response<Body>;
        type Error = BoxError;

        async fn serve(
            &self,
            ctx: Context<()>,
            req: Request<Body>,
        ) -> Result<Self::Response, Self::Error> {
            let transport = ctx
                .get::<Agent>()
                .and_then(|agent| agent.resolve(req.uri()))
                .ok_or("no transport")?;
            transport.serve(ctx, req).await
        }
    }

    fn har_fetch_layer(transport: &Counting) -> HarFetchLayer {
        let transport = transport.clone();
        HarFetchLayer::new(move |_| Transport::new(transport.clone()))
    }

    fn get() -> Request<Body> {
        Request::get("http://example.com/").body(full("")).unwrap()
    }

    #[tokio::test]
    async fn default_page_ref_and_response_extension() {
        let transport = Counting::default();
        let fetch = har_fetch_layer(&transport).layer(OneShot);

        let resp = fetch.serve(Context::default(), get()).await.unwrap();
        let entry = resp.extensions().get::<HarEntry>().unwrap().clone();
        assert_eq!(entry.pageref.as_deref(), Some(DEFAULT_PAGE_ID));
        assert_eq!(entry.response.content.text.as_deref(), Some("ok"));
        assert_eq!(entry.response.body_size, 2);
        assert_eq!(resp.headers()["x-served-by"], "counting");
        assert_eq!(resp.into_body().collect().await.unwrap().to_bytes(), "ok");
        assert!(fetch.pending_table().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn disabled_call_is_not_traced() {
        let transport = Counting::default();
        let on_entry_calls = Arc::new(AtomicUsize::new(0));
        let counter = on_entry_calls.clone();
        let fetch = har_fetch_layer(&transport)
            .with_on_entry(move |_: &Entry| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .layer(OneShot);

        let mut ctx = Context::default();
        ctx.insert(Agent::transport(Transport::new(transport.clone())));
        let mut req = get();
        req.extensions_mut().insert(HarOptions::new().disabled());
        let resp = fetch.serve(ctx, req).await.unwrap();

        assert!(resp.extensions().get::<HarEntry>().is_none());
        assert_eq!(transport.dispatched.load(Ordering::SeqCst), 1);
        assert_eq!(transport.saw_token.load(Ordering::SeqCst), 0);
        assert_eq!(on_entry_calls.load(Ordering::SeqCst), 0);
        assert!(fetch.pending_table().is_empty());
        assert!(logs_contain("HAR disabled for fetch"));
    }

    #[tokio::test]
    async fn disabled_call_without_agent_uses_default_transport() {
        let transport = Counting::default();
        let on_entry_calls = Arc::new(AtomicUsize::new(0));
        let counter = on_entry_calls.clone();
        let fetch = har_fetch_layer(&transport).layer(OneShot);

        let mut req = get();
        req.extensions_mut().insert(
            HarOptions::new()
                .disabled()
                .with_on_entry(move |_: &Entry| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        );
        let resp = fetch.serve(Context::default(), req).await.unwrap();

        assert_eq!(resp.into_body().collect().await.unwrap().to_bytes(), "ok");
        assert_eq!(transport.dispatched.load(Ordering::SeqCst), 1);
        assert_eq!(transport.saw_token.load(Ordering::SeqCst), 0);
        assert_eq!(on_entry_calls.load(Ordering::SeqCst), 0);
        assert!(fetch.pending_table().is_empty());
    }

    #[tokio::test]
    async fn per_call_options_override_defaults() {
        let transport = Counting::default();
        let default_log = SharedHarLog::new(Har::new(Vec::new()));
        let call_log = SharedHarLog::new(Har::new(Vec::new()));
        let fetch = har_fetch_layer(&transport)
            .with_har_log(default_log.clone())
            .with_page_ref("default_page")
            .layer(OneShot);

        let mut req = get();
        req.extensions_mut().insert(
            HarOptions::new()
                .with_har_log(call_log.clone())
                .with_page_ref("page_2"),
        );
        fetch.serve(Context::default(), req).await.unwrap();

        assert!(default_log.is_empty());
        let har = call_log.snapshot();
        assert_eq!(har.log.entries.len(), 1);
        assert_eq!(har.log.entries[0].pageref.as_deref(), Some("page_2"));

        fetch.serve(Context::default(), get()).await.unwrap();
        let har = default_log.snapshot();
        assert_eq!(har.log.entries[0].pageref.as_deref(), Some("default_page"));
    }

    #[tokio::test]
    async fn disabled_by_default_can_be_enabled_per_call() {
        let transport = Counting::default();
        let log = SharedHarLog::new(Har::new(Vec::new()));
        let fetch = har_fetch_layer(&transport).with_har_disabled().layer(OneShot);

        let resp = fetch.serve(Context::default(), get()).await.unwrap();
        assert!(resp.extensions().get::<HarEntry>().is_none());

        let mut req = get();
        req.extensions_mut().insert(HarOptions::new().with_har_log(log.clone()));
        fetch.serve(Context::default(), req).await.unwrap();

        assert_eq!(log.len(), 1);
        assert_eq!(transport.dispatched.load(Ordering::SeqCst), 2);
        assert_eq!(transport.saw_token.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enabled_per_call_hands_entries_to_callback_only() {
        let transport = Counting::default();
        let default_log = SharedHarLog::new(Har::new(Vec::new()));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let fetch = har_fetch_layer(&transport)
            .with_har_log(default_log.clone())
            .layer(OneShot);

        let mut req = get();
        req.extensions_mut().insert(
            HarOptions::new()
                .enabled()
                .with_on_entry(move |_: &Entry| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        );
        let resp = fetch.serve(Context::default(), req).await.unwrap();

        assert!(resp.extensions().get::<HarEntry>().is_some());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(default_log.is_empty());
    }

    #[tokio::test]
    async fn response_builder_override() {
        let transport = Counting::default();
        let fetch = har_fetch_layer(&transport)
            .with_response_builder(|parts, body| {
                let mut resp = Response::from_parts(parts, full(body));
                resp.headers_mut().insert("x-rebuilt", http::HeaderValue::from_static("1"));
                resp
            })
            .layer(OneShot);

        let resp = fetch.serve(Context::default(), get()).await.unwrap();
        assert_eq!(resp.headers()["x-rebuilt"], "1");
        assert!(resp.extensions().get::<HarEntry>().is_some());
    }

    #[tokio::test]
    async fn shared_pending_table() {
        let transport = Counting::default();
        let table = PendingEntryTable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let fetch = har_fetch_layer(&transport)
            .with_pending_table(table.clone())
            .with_on_entry(move |entry: &Entry| sink.lock().push(entry.request.url.clone()))
            .layer(OneShot);

        fetch.serve(Context::default(), get()).await.unwrap();
        assert!(table.is_empty());
        assert_eq!(*seen.lock(), vec!["http://example.com/".to_owned()]);
    }

    #[tokio::test]
    async fn transport_failure_is_returned_unchanged() {
        struct Refused;

        impl Service<(), Request<Body>> for Refused {
            type Response = Response<Body>;
            type Error = BoxError;

            async fn serve(
                &self,
                _ctx: Context<()>,
                _req: Request<Body>,
            ) -> Result<Self::Response, Self::Error> {
                Err("connection refused".into())
            }
        }

        let fetch = HarFetch::new(OneShot, |_| Transport::new(Refused));
        let err = fetch.serve(Context::default(), get()).await.unwrap_err();
        assert_eq!(err.to_string(), "connection refused");
        assert!(fetch.pending_table().is_empty());
    }
}
