//! Body type used by transports and fetchers, and the body wrappers
//! that observe (but never alter) the bytes flowing through them.

use crate::spec::{PostData, PostParam};
use bytes::{Bytes, BytesMut};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use rama_core::error::BoxError;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;

/// Request and response body exchanged with transports and fetch services.
pub type Body = BoxBody<Bytes, BoxError>;

/// A [`Body`] containing the given data.
pub fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// An empty [`Body`].
#[must_use]
pub fn empty() -> Body {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// What the [`CaptureBody`] observed once the request body was fully written.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedBody {
    /// Number of bytes written.
    pub size: usize,
    /// Posted data, only present when the request has a content type.
    pub post_data: Option<PostData>,
}

#[derive(Debug, Default)]
struct CaptureState {
    buffer: BytesMut,
    written: bool,
    captured: Option<CapturedBody>,
    finished_at: Option<Instant>,
}

/// Shared handle to the state of a [`CaptureBody`].
#[derive(Debug, Clone)]
pub struct BodyCapture {
    mime_type: Option<Arc<str>>,
    state: Arc<Mutex<CaptureState>>,
}

impl BodyCapture {
    /// Create a new capture for a request with the given content type.
    #[must_use]
    pub fn new(mime_type: Option<&str>) -> Self {
        Self {
            mime_type: mime_type.map(Into::into),
            state: Default::default(),
        }
    }

    /// Wrap the body so that everything written through it is captured.
    #[must_use]
    pub fn wrap<B>(&self, inner: B) -> CaptureBody<B> {
        CaptureBody {
            inner,
            capture: self.clone(),
        }
    }

    fn write(&self, chunk: &Bytes) {
        let mut state = self.state.lock();
        if state.captured.is_none() {
            state.written = true;
            state.buffer.extend_from_slice(chunk);
        }
    }

    /// Mark the body as fully written.
    ///
    /// Only the first call has an effect.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if state.finished_at.is_some() {
            return;
        }
        state.finished_at = Some(Instant::now());
        if state.written {
            let body = state.buffer.split().freeze();
            state.captured = Some(build_captured_body(self.mime_type.as_deref(), &body));
        }
    }

    /// Instant at which the body was fully written, if it was.
    #[must_use]
    pub fn finished_at(&self) -> Option<Instant> {
        self.state.lock().finished_at
    }

    /// The captured body, `None` if no body was written.
    ///
    /// Chunks written without the end of the body being observed are
    /// captured as if the body ended now.
    #[must_use]
    pub fn captured(&self) -> Option<CapturedBody> {
        let written = self.state.lock().written;
        if written {
            self.finish();
        }
        self.state.lock().captured.clone()
    }
}

fn build_captured_body(mime_type: Option<&str>, body: &Bytes) -> CapturedBody {
    let post_data = mime_type.map(|mime_type| {
        let text = String::from_utf8_lossy(body);
        if is_form_urlencoded(mime_type) {
            match serde_html_form::from_str::<Vec<(String, String)>>(&text) {
                Ok(params) => {
                    return PostData {
                        mime_type: mime_type.to_owned(),
                        params: Some(
                            params
                                .into_iter()
                                .map(|(name, value)| PostParam {
                                    name,
                                    value: Some(value),
                                    ..Default::default()
                                })
                                .collect(),
                        ),
                        ..Default::default()
                    };
                }
                Err(err) => {
                    tracing::debug!("failed to parse form body, record it as text: {err}");
                }
            }
        }
        PostData {
            mime_type: mime_type.to_owned(),
            text: Some(text.into_owned()),
            ..Default::default()
        }
    });

    CapturedBody {
        size: body.len(),
        post_data,
    }
}

fn is_form_urlencoded(mime_type: &str) -> bool {
    mime_type
        .parse::<mime::Mime>()
        .is_ok_and(|mime| {
            mime.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str()
        })
}

pin_project! {
    /// Request body that captures every data frame written through it,
    /// see [`BodyCapture`].
    pub struct CaptureBody<B> {
        #[pin]
        inner: B,
        capture: BodyCapture,
    }
}

impl<B> HttpBody for CaptureBody<B>
where
    B: HttpBody<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.capture.write(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => {
                this.capture.finish();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[derive(Debug, Default)]
struct TapState {
    bytes: u64,
    seen: bool,
    finished_at: Option<Instant>,
}

/// Counts the raw (still content-encoded) bytes of a response body.
#[derive(Debug, Clone, Default)]
pub struct ResponseTap {
    state: Arc<Mutex<TapState>>,
}

impl ResponseTap {
    /// Create a new [`ResponseTap`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the body so that its data frames are counted.
    #[must_use]
    pub fn wrap<B>(&self, inner: B) -> TapBody<B> {
        TapBody {
            inner,
            tap: self.clone(),
        }
    }

    /// Number of raw bytes seen, `None` if no data frame was seen at all.
    #[must_use]
    pub fn raw_bytes(&self) -> Option<u64> {
        let state = self.state.lock();
        state.seen.then_some(state.bytes)
    }

    /// Instant at which the end of the body was observed, if it was.
    #[must_use]
    pub fn finished_at(&self) -> Option<Instant> {
        self.state.lock().finished_at
    }
}

pin_project! {
    /// Response body that counts its data frames, see [`ResponseTap`].
    pub struct TapBody<B> {
        #[pin]
        inner: B,
        tap: ResponseTap,
    }
}

impl<B> HttpBody for TapBody<B>
where
    B: HttpBody<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        let mut state = this.tap.state.lock();
        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    state.seen = true;
                    state.bytes += data.len() as u64;
                }
            }
            Some(Err(_)) => (),
            None => {
                state.finished_at.get_or_insert_with(Instant::now);
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
