//! Transports dispatch physical requests, [`HarTransport`] records them.
//!
//! A transport is any rama [`Service`] serving a single physical request,
//! without following redirects. It reports the progress of a request
//! through the [`Lifecycle`] found in the request extensions, if any.

use crate::body::{Body, BodyCapture, ResponseTap};
use crate::entry::{build_entry, build_response, is_compressed};
use crate::headers::first_header_value;
use crate::lifecycle::{EventKind, Lifecycle, LifecycleEvent, ListenerId};
use crate::pending::{
    CORRELATION_HEADER, CorrelationToken, EntryState, PendingEntry, PendingEntryTable,
};
use crate::timing::{Milestone, TimestampSet};
use http::{Request, Response, Uri};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use rama_core::error::BoxError;
use rama_core::service::BoxService;
use rama_core::{Context, Layer, Service};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// A boxed transport service, for where you require dynamic dispatch.
pub type BoxTransport = BoxService<(), Request<Body>, Response<Body>, BoxError>;

/// A transport selected for a fetch call.
///
/// Keeps track of the [`PendingEntryTable`]s its requests are already
/// recorded into, so that [`Transport::instrument`] never records a
/// request twice in the same table.
#[derive(Clone)]
pub struct Transport {
    service: Arc<BoxTransport>,
    recorded_by: Vec<PendingEntryTable>,
}

impl Transport {
    /// Create a new, not yet instrumented, [`Transport`].
    pub fn new<S>(service: S) -> Self
    where
        S: Service<(), Request<Body>, Response = Response<Body>, Error = BoxError>,
    {
        Self {
            service: Arc::new(service.boxed()),
            recorded_by: Vec::new(),
        }
    }

    /// Whether the requests of this transport are recorded into the table.
    #[must_use]
    pub fn is_recorded_by(&self, table: &PendingEntryTable) -> bool {
        self.recorded_by.iter().any(|other| other.same_table(table))
    }

    /// Wrap this transport in a [`HarTransport`] recording into the table,
    /// unless it already records into that table.
    ///
    /// Tables of other tracers do not count: wrapping a transport that is
    /// instrumented for another table adds a recorder for this one.
    #[must_use]
    pub fn instrument(self, table: &PendingEntryTable) -> Self {
        if self.is_recorded_by(table) {
            return self;
        }
        let mut recorded_by = self.recorded_by;
        recorded_by.push(table.clone());
        Self {
            service: HarTransportLayer::new(table.clone())
                .layer(self.service)
                .boxed()
                .into(),
            recorded_by,
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("service", &self.service)
            .field("recorded_by", &self.recorded_by)
            .finish()
    }
}

impl Service<(), Request<Body>> for Transport {
    type Response = Response<Body>;
    type Error = BoxError;

    #[inline]
    fn serve(
        &self,
        ctx: Context<()>,
        req: Request<Body>,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + '_ {
        self.service.serve(ctx, req)
    }
}

/// A [`Layer`] that produces [`HarTransport`]s recording into a
/// [`PendingEntryTable`].
#[derive(Debug, Clone)]
pub struct HarTransportLayer {
    table: PendingEntryTable,
}

impl HarTransportLayer {
    /// Create a new [`HarTransportLayer`] recording into the given table.
    #[must_use]
    pub const fn new(table: PendingEntryTable) -> Self {
        Self { table }
    }
}

impl<S> Layer<S> for HarTransportLayer {
    type Service = HarTransport<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HarTransport {
            inner,
            table: self.table.clone(),
        }
    }
}

/// Marks a request as recorded by the [`HarTransport`] that dispatches it.
#[derive(Debug, Clone, Copy)]
struct Recorded;

/// Transport service that records every request carrying a
/// [`CorrelationToken`] reserved in its [`PendingEntryTable`].
///
/// Requests without [`CORRELATION_HEADER`], or with a token reserved
/// elsewhere, pass through untouched.
pub struct HarTransport<S> {
    inner: S,
    table: PendingEntryTable,
}

impl<S> HarTransport<S> {
    /// Create a new [`HarTransport`] recording into the given table.
    pub const fn new(inner: S, table: PendingEntryTable) -> Self {
        Self { inner, table }
    }

    /// Reference to the inner transport.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Consumes `self`, returning the inner transport.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: fmt::Debug> fmt::Debug for HarTransport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarTransport")
            .field("inner", &self.inner)
            .field("table", &self.table)
            .finish()
    }
}

impl<S: Clone> Clone for HarTransport<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            table: self.table.clone(),
        }
    }
}

impl<State, S> Service<State, Request<Body>> for HarTransport<S>
where
    State: Clone + Send + Sync + 'static,
    S: Service<State, Request<Body>, Response = Response<Body>, Error = BoxError>,
{
    type Response = Response<Body>;
    type Error = BoxError;

    async fn serve(
        &self,
        ctx: Context<State>,
        req: Request<Body>,
    ) -> Result<Self::Response, Self::Error> {
        if req.extensions().get::<Recorded>().is_some() {
            return self.inner.serve(ctx, req).await;
        }

        let token = req
            .headers()
            .get(&CORRELATION_HEADER)
            .map(CorrelationToken::from_header_value);
        let token = match token {
            None => return self.inner.serve(ctx, req).await,
            Some(None) => {
                tracing::debug!("invalid HAR correlation header value, dispatch untraced");
                return self.inner.serve(ctx, req).await;
            }
            Some(Some(token)) if !self.table.is_reserved(&token) => {
                tracing::debug!("unknown HAR correlation token {token}, dispatch untraced");
                return self.inner.serve(ctx, req).await;
            }
            Some(Some(token)) => token,
        };

        self.serve_traced(ctx, req, token).await
    }
}

impl<S> HarTransport<S> {
    async fn serve_traced<State>(
        &self,
        ctx: Context<State>,
        req: Request<Body>,
        token: CorrelationToken,
    ) -> Result<Response<Body>, BoxError>
    where
        State: Clone + Send + Sync + 'static,
        S: Service<State, Request<Body>, Response = Response<Body>, Error = BoxError>,
    {
        let (mut parts, body) = req.into_parts();

        let entry = build_entry(&parts, Some(&CORRELATION_HEADER));
        let capture = BodyCapture::new(first_header_value(&entry.request.headers, "content-type"));
        let mut state = EntryState::new(entry, TimestampSet::begin());
        state.capture = Some(capture.clone());
        let state = Arc::new(Mutex::new(state));

        if !self.table.insert(&token, PendingEntry::new(state.clone())) {
            tracing::debug!("HAR slot {token} released before dispatch, entry dropped");
        }

        let lifecycle = match parts.extensions.get::<Lifecycle>() {
            Some(lifecycle) => lifecycle.clone(),
            None => {
                let lifecycle = Lifecycle::new();
                parts.extensions.insert(lifecycle.clone());
                lifecycle
            }
        };
        parts.extensions.insert(Recorded);
        let listeners = Listeners::observe(&lifecycle, &state);

        let req = Request::from_parts(parts, capture.wrap(body).boxed());
        let result = self.inner.serve(ctx, req).await;
        listeners.clear();

        let response = result?;
        let first_response_byte = Instant::now();

        let (parts, body) = response.into_parts();
        let har_response = build_response(&parts);
        let tap = ResponseTap::new();
        {
            let mut state = state.lock();
            let timestamps = &mut state.timestamps;
            timestamps.record_at(Milestone::FirstResponseByte, first_response_byte);
            timestamps.record_at(
                Milestone::RequestSent,
                capture.finished_at().unwrap_or(first_response_byte),
            );
            state.compressed = is_compressed(&har_response.headers);
            state.entry.request.http_version = har_response.http_version.clone();
            state.entry.response = har_response;
            state.tap = Some(tap.clone());
        }
        tracing::trace!("recorded response head {} for HAR slot {token}", parts.status);

        Ok(Response::from_parts(parts, tap.wrap(body).boxed()))
    }
}

/// Listeners registered for a single traced dispatch.
#[derive(Clone, Default)]
struct Listeners {
    registered: Arc<Mutex<Registered>>,
}

#[derive(Default)]
struct Registered {
    request: Vec<(Lifecycle, ListenerId)>,
    connection: Vec<(Lifecycle, ListenerId)>,
}

impl Listeners {
    fn observe(lifecycle: &Lifecycle, state: &Arc<Mutex<EntryState>>) -> Self {
        let listeners = Self::default();

        let socket = {
            let state = state.clone();
            let listeners = listeners.clone();
            lifecycle.once(EventKind::SocketAcquired, move |event| {
                state.lock().timestamps.record(Milestone::SocketAcquired);
                let LifecycleEvent::SocketAcquired(connection) = event else {
                    return;
                };
                tracing::trace!("socket acquired: connection #{}", connection.id());
                let hub = connection.lifecycle();
                for (kind, milestone) in [
                    (EventKind::DnsResolved, Milestone::DnsLookup),
                    (EventKind::Connected, Milestone::Connected),
                    (EventKind::SecureConnected, Milestone::SecureConnected),
                ] {
                    let state = state.clone();
                    let id = hub.once(kind, move |_| {
                        state.lock().timestamps.record(milestone);
                    });
                    listeners.registered.lock().connection.push((hub.clone(), id));
                }
            })
        };

        let sent = {
            let state = state.clone();
            let listeners = listeners.clone();
            lifecycle.once(EventKind::RequestSent, move |_| {
                state.lock().timestamps.record(Milestone::RequestSent);
                listeners.clear_connection_listeners();
            })
        };

        {
            let mut registered = listeners.registered.lock();
            registered.request.push((lifecycle.clone(), socket));
            registered.request.push((lifecycle.clone(), sent));
        }
        listeners
    }

    fn clear_connection_listeners(&self) {
        let connection = std::mem::take(&mut self.registered.lock().connection);
        for (hub, id) in connection {
            hub.remove(id);
        }
    }

    fn clear(&self) {
        let registered = std::mem::take(&mut *self.registered.lock());
        for (hub, id) in registered.request.into_iter().chain(registered.connection) {
            hub.remove(id);
        }
    }
}

/// Transport selection for a fetch call, see [`Agent::resolve`].
///
/// [`HarFetch`](crate::fetch::HarFetch) hands the agent to the fetch
/// service it wraps through the [`Context`]: base fetch services read it
/// with `ctx.get::<Agent>()`.
#[derive(Clone)]
pub enum Agent {
    /// Use this transport for every hop.
    Transport(Transport),
    /// Create a transport for every hop, `None` falls back to the default one.
    Factory(TransportFactory),
}

/// Creates (or selects) a transport for the given request uri.
pub type TransportFactory = Arc<dyn Fn(&Uri) -> Option<Transport> + Send + Sync + 'static>;

impl Agent {
    /// Create an [`Agent`] that uses the given transport for every hop.
    #[must_use]
    pub fn transport(transport: Transport) -> Self {
        Self::Transport(transport)
    }

    /// Create an [`Agent`] that asks the factory for a transport for every hop.
    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn(&Uri) -> Option<Transport> + Send + Sync + 'static,
    {
        Self::Factory(Arc::new(factory))
    }

    /// The transport to dispatch a request to the given uri with.
    #[must_use]
    pub fn resolve(&self, uri: &Uri) -> Option<Transport> {
        match self {
            Self::Transport(transport) => Some(transport.clone()),
            Self::Factory(factory) => factory(uri),
        }
    }

    /// Instrument the transports selected by this agent for the table of
    /// the shared default transports.
    ///
    /// A factory that yields no transport falls back to the shared default one.
    #[must_use]
    pub fn instrumented(self, defaults: &Arc<SharedTransports>) -> Self {
        match self {
            Self::Transport(transport) => Self::Transport(transport.instrument(&defaults.table)),
            Self::Factory(factory) => {
                let defaults = defaults.clone();
                Self::factory(move |uri| {
                    Some(match factory(uri) {
                        Some(transport) => transport.instrument(&defaults.table),
                        None => defaults.get(TransportScheme::from_uri(uri)),
                    })
                })
            }
        }
    }

    /// An agent that picks the shared default transport for the scheme of each hop.
    #[must_use]
    pub fn shared_default(defaults: &Arc<SharedTransports>) -> Self {
        let defaults = defaults.clone();
        Self::factory(move |uri| Some(defaults.get(TransportScheme::from_uri(uri))))
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(transport) => f.debug_tuple("Transport").field(transport).finish(),
            Self::Factory(_) => f.debug_tuple("Factory").finish(),
        }
    }
}

/// Origin scheme of a request, plaintext or encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportScheme {
    Http,
    Https,
}

impl TransportScheme {
    /// Scheme of the uri, anything but `https` and `wss` is plaintext.
    #[must_use]
    pub fn from_uri(uri: &Uri) -> Self {
        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => Self::Https,
            Some(scheme) if scheme.eq_ignore_ascii_case("wss") => Self::Https,
            _ => Self::Http,
        }
    }
}

/// Creates the default transport for a scheme.
pub type MakeTransport = Arc<dyn Fn(TransportScheme) -> Transport + Send + Sync + 'static>;

/// The instrumented default transports, one per [`TransportScheme`],
/// created on first use and shared by all calls afterwards.
pub struct SharedTransports {
    make: MakeTransport,
    table: PendingEntryTable,
    http: OnceLock<Transport>,
    https: OnceLock<Transport>,
}

impl SharedTransports {
    /// Create a new, still empty, set of shared transports.
    pub fn new(make: MakeTransport, table: PendingEntryTable) -> Self {
        Self {
            make,
            table,
            http: OnceLock::new(),
            https: OnceLock::new(),
        }
    }

    /// The shared transport for the given scheme.
    pub fn get(&self, scheme: TransportScheme) -> Transport {
        let cell = match scheme {
            TransportScheme::Http => &self.http,
            TransportScheme::Https => &self.https,
        };
        cell.get_or_init(|| {
            tracing::trace!("create shared default {scheme:?} transport");
            (self.make)(scheme).instrument(&self.table)
        })
        .clone()
    }

    /// The function creating the default transports.
    #[must_use]
    pub fn make_transport(&self) -> &MakeTransport {
        &self.make
    }

    /// The table the shared transports record into.
    #[must_use]
    pub fn table(&self) -> &PendingEntryTable {
        &self.table
    }
}

impl fmt::Debug for SharedTransports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTransports")
            .field("table", &self.table)
            .field("http", &self.http.get())
            .field("https", &self.https.get())
            .finish()
    }
}
