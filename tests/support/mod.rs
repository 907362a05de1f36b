use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE, LOCATION, SET_COOKIE};
use http::{Method, Request, Response, StatusCode, Uri, request};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use rama_har::body::{Body, empty, full};
use rama_core::error::BoxError;
use rama_core::{Context, Service};
use rama_har::Agent;
use rama_har::lifecycle::{Connection, Lifecycle, LifecycleEvent};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const MAX_REDIRECTS: usize = 10;

/// Header under which the fetch layer sends its correlation token.
pub(crate) const CORRELATION_HEADER: &str = "x-har-request-id";

type Handler = Arc<dyn Fn(&request::Parts, &Bytes) -> Result<Response<Body>, BoxError> + Send + Sync>;

/// In-memory server reached through a keep-alive connection,
/// emitting the lifecycle events a real client connection would.
#[derive(Clone)]
pub(crate) struct MockTransport {
    handler: Handler,
    tls: bool,
    keep_alive: bool,
    connection: Arc<Mutex<Option<Connection>>>,
    dispatched: Arc<AtomicUsize>,
    traced: Arc<AtomicUsize>,
}

impl MockTransport {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(&request::Parts, &Bytes) -> Result<Response<Body>, BoxError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            tls: false,
            keep_alive: true,
            connection: Default::default(),
            dispatched: Default::default(),
            traced: Default::default(),
        }
    }

    /// Answer every request with a `200 OK` carrying the given text.
    pub(crate) fn text(body: &'static str) -> Self {
        Self::new(move |_, _| text(body))
    }

    pub(crate) fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    pub(crate) fn without_keep_alive(mut self) -> Self {
        self.keep_alive = false;
        self
    }

    /// Number of requests dispatched so far.
    pub(crate) fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Number of requests that arrived with a correlation token.
    pub(crate) fn traced(&self) -> usize {
        self.traced.load(Ordering::SeqCst)
    }

    /// Listeners still registered on the kept-alive connection.
    pub(crate) fn connection_listeners(&self) -> usize {
        self.connection
            .lock()
            .as_ref()
            .map_or(0, |conn| conn.lifecycle().listener_count())
    }

    fn acquire(&self) -> (Connection, bool) {
        let mut kept = self.connection.lock();
        match kept.as_ref() {
            Some(conn) if self.keep_alive => (conn.clone(), false),
            _ => {
                let conn = Connection::new();
                *kept = Some(conn.clone());
                (conn, true)
            }
        }
    }
}

async fn tick() {
    tokio::time::sleep(Duration::from_millis(2)).await;
}

impl Service<(), Request<Body>> for MockTransport {
    type Response = Response<Body>;
    type Error = BoxError;

    async fn serve(
        &self,
        _ctx: Context<()>,
        req: Request<Body>,
    ) -> Result<Self::Response, Self::Error> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        if req.headers().contains_key(CORRELATION_HEADER) {
            self.traced.fetch_add(1, Ordering::SeqCst);
        }

        let lifecycle = Lifecycle::of(&req).cloned().unwrap_or_default();
        let (conn, fresh) = self.acquire();

        tick().await;
        lifecycle.emit(&LifecycleEvent::SocketAcquired(conn.clone()));
        if fresh {
            tick().await;
            conn.lifecycle().emit(&LifecycleEvent::DnsResolved);
            tick().await;
            conn.lifecycle().emit(&LifecycleEvent::Connected);
            if self.tls {
                tick().await;
                conn.lifecycle().emit(&LifecycleEvent::SecureConnected);
            }
        }

        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        lifecycle.emit(&LifecycleEvent::RequestSent);

        tick().await;
        (self.handler)(&parts, &body)
    }
}

/// A `200 OK` text response.
pub(crate) fn text(body: &'static str) -> Result<Response<Body>, BoxError> {
    Ok(Response::builder()
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(body))?)
}

/// A `200 OK` text response, gzip encoded.
pub(crate) fn gzip_text(body: &str) -> Result<Response<Body>, BoxError> {
    Ok(Response::builder()
        .header(CONTENT_TYPE, "text/plain")
        .header(CONTENT_ENCODING, "gzip")
        .body(full(gzip(body.as_bytes())?))?)
}

/// A redirect to the given location.
pub(crate) fn redirect(status: StatusCode, location: &str) -> Result<Response<Body>, BoxError> {
    Ok(Response::builder()
        .status(status)
        .header(LOCATION, location)
        .header(SET_COOKIE, "hop=1; Path=/")
        .body(full("moved"))?)
}

pub(crate) fn gzip(data: &[u8]) -> Result<Bytes, BoxError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?.into())
}

/// Minimal fetch service: follows redirects (reusing the headers of the
/// original request) and decodes gzip bodies. Every hop is dispatched with
/// the [`Agent`] found in the context.
#[derive(Debug, Clone, Default)]
pub(crate) struct SimpleFetch;

impl Service<(), Request<Body>> for SimpleFetch {
    type Response = Response<Body>;
    type Error = BoxError;

    async fn serve(
        &self,
        ctx: Context<()>,
        req: Request<Body>,
    ) -> Result<Self::Response, Self::Error> {
        let agent = ctx.get::<Agent>().cloned().ok_or("no agent in context")?;
        let (parts, body) = req.into_parts();
        let headers = parts.headers;
        let mut method = parts.method;
        let mut uri = parts.uri;
        let mut body = Some(body);

        for _ in 0..=MAX_REDIRECTS {
            let transport = agent
                .resolve(&uri)
                .ok_or_else(|| format!("no transport for {uri}"))?;
            let mut req = Request::builder()
                .method(method.clone())
                .uri(uri.clone())
                .body(body.take().unwrap_or_else(empty))?;
            *req.headers_mut() = headers.clone();

            let resp = transport.serve(ctx.clone(), req).await?;
            let status = resp.status();
            let location = resp.headers().get(LOCATION).cloned();
            match location {
                Some(location) if status.is_redirection() => {
                    resp.into_body().collect().await?;
                    uri = resolve(&uri, location.to_str()?)?;
                    if status == StatusCode::SEE_OTHER || method == Method::POST {
                        method = Method::GET;
                    }
                }
                _ => return decode(resp).await,
            }
        }
        Err("too many redirects".into())
    }
}

fn resolve(base: &Uri, location: &str) -> Result<Uri, BoxError> {
    if location.starts_with('/') {
        let mut parts = base.clone().into_parts();
        parts.path_and_query = Some(location.parse()?);
        Ok(Uri::from_parts(parts)?)
    } else {
        Ok(location.parse()?)
    }
}

async fn decode(resp: Response<Body>) -> Result<Response<Body>, BoxError> {
    let gzipped = resp
        .headers()
        .get(CONTENT_ENCODING)
        .is_some_and(|coding| coding == "gzip");
    if !gzipped {
        return Ok(resp);
    }
    let (parts, body) = resp.into_parts();
    let raw = body.collect().await?.to_bytes();
    let mut decoded = Vec::new();
    GzDecoder::new(raw.as_ref()).read_to_end(&mut decoded)?;
    Ok(Response::from_parts(parts, full(decoded)))
}
