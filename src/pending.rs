//! Correlation of physical requests with the logical fetch call that issued them.
//!
//! A fetch call reserves a [`CorrelationToken`] in the [`PendingEntryTable`]
//! and sends it along in the [`CORRELATION_HEADER`]. Every physical request
//! that carries a reserved token gets an entry in the table. Redirected
//! requests reuse the headers of the original request, so a second entry
//! under the same token evicts the first one and adopts it as its parent.

use crate::body::{BodyCapture, ResponseTap};
use crate::entry::apply_captured_body;
use crate::spec::Entry;
use crate::timing::{Milestone, TimestampSet};
use http::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Header in which the [`CorrelationToken`] travels from the fetch layer
/// down to the transport.
///
/// It is reserved for internal use, its name is not part of the stable api.
pub static CORRELATION_HEADER: HeaderName = HeaderName::from_static("x-har-request-id");

/// Opaque id of a logical fetch call, shared by all its redirect hops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationToken(Arc<str>);

impl CorrelationToken {
    /// Generate a new unique token.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string().into())
    }

    /// Read the token from a header value, `None` if it is not valid text.
    #[must_use]
    pub fn from_header_value(value: &HeaderValue) -> Option<Self> {
        let value = value.to_str().ok()?.trim();
        (!value.is_empty()).then(|| Self(value.into()))
    }

    /// Encode the token as a header value.
    pub fn to_header_value(&self) -> Result<HeaderValue, http::header::InvalidHeaderValue> {
        HeaderValue::from_str(&self.0)
    }

    /// The token as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// In-progress state of a single physical request.
#[derive(Debug)]
pub(crate) struct EntryState {
    pub(crate) entry: Entry,
    pub(crate) timestamps: TimestampSet,
    pub(crate) compressed: bool,
    pub(crate) capture: Option<BodyCapture>,
    pub(crate) tap: Option<ResponseTap>,
}

impl EntryState {
    pub(crate) fn new(entry: Entry, timestamps: TimestampSet) -> Self {
        Self {
            entry,
            timestamps,
            compressed: false,
            capture: None,
            tap: None,
        }
    }

    /// Record the request body and compute the timings, the body being
    /// received at `body_received` (or when the response head arrived).
    pub(crate) fn finalize(&mut self, body_received: Option<Instant>) {
        if let Some(capture) = self.capture.take() {
            apply_captured_body(&mut self.entry.request, capture.captured());
        }
        if let Some(at) = body_received {
            self.timestamps.record_at(Milestone::BodyReceived, at);
        }
        self.entry.timings = self.timestamps.finalize();
        self.entry.time = self.timestamps.total_ms();
    }

    /// Complete a hop whose body is never handed to the fetch caller,
    /// recording only what the raw body tap observed.
    fn finalize_hop(&mut self) {
        let tap = self.tap.take();
        if let Some(raw) = tap.as_ref().and_then(ResponseTap::raw_bytes) {
            let raw = i64::try_from(raw).unwrap_or(i64::MAX);
            self.entry.response.body_size = raw;
            if !self.compressed {
                self.entry.response.content.size = raw;
            }
        }
        self.finalize(tap.as_ref().and_then(ResponseTap::finished_at));
    }
}

/// Entry of a physical request in the [`PendingEntryTable`], together with
/// the entry of the redirect hop that preceded it, if any.
#[derive(Debug)]
pub struct PendingEntry {
    pub(crate) state: Arc<Mutex<EntryState>>,
    parent: Option<Box<PendingEntry>>,
}

impl PendingEntry {
    pub(crate) fn new(state: Arc<Mutex<EntryState>>) -> Self {
        Self {
            state,
            parent: None,
        }
    }

    /// Number of hops, this one included.
    #[must_use]
    pub fn hops(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |parent| parent.hops())
    }

    /// A copy of the entry of this hop as it is right now.
    #[must_use]
    pub fn entry(&self) -> Entry {
        self.state.lock().entry.clone()
    }

    /// Flatten the redirect chain into its entries, oldest first,
    /// this hop last.
    pub(crate) fn flatten(self) -> Vec<Entry> {
        let mut chain = Vec::with_capacity(self.hops());
        let mut next = Some(self);
        while let Some(mut hop) = next {
            next = hop.parent.take().map(|parent| *parent);
            chain.push(hop.entry());
        }
        chain.reverse();
        chain
    }
}

#[derive(Debug)]
enum Slot {
    Reserved,
    Pending(PendingEntry),
}

/// Shared map of [`CorrelationToken`]s to the entry of their latest
/// physical request.
///
/// Cloning gives another handle to the same table.
#[derive(Debug, Clone, Default)]
pub struct PendingEntryTable {
    slots: Arc<Mutex<HashMap<CorrelationToken, Slot>>>,
}

impl PendingEntryTable {
    /// Create a new, empty [`PendingEntryTable`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for a new logical fetch call.
    ///
    /// The slot is released when the returned guard is dropped.
    #[must_use]
    pub fn reserve(&self) -> PendingGuard {
        let token = CorrelationToken::generate();
        self.slots.lock().insert(token.clone(), Slot::Reserved);
        tracing::trace!("reserved pending HAR slot {token}");
        PendingGuard {
            table: self.clone(),
            token,
        }
    }

    /// Whether both handles refer to the same table.
    #[must_use]
    pub fn same_table(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots)
    }

    /// Whether the token belongs to a fetch call that is in progress.
    #[must_use]
    pub fn is_reserved(&self, token: &CorrelationToken) -> bool {
        self.slots.lock().contains_key(token)
    }

    /// Store the entry of a new physical request under the token.
    ///
    /// An entry already stored under the token is the previous redirect
    /// hop: it is completed and becomes the parent of the new entry.
    /// Returns `false` (dropping the entry) if the token is not reserved.
    pub(crate) fn insert(&self, token: &CorrelationToken, mut entry: PendingEntry) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(token) else {
            return false;
        };
        if let Slot::Pending(parent) = std::mem::replace(slot, Slot::Reserved) {
            parent.state.lock().finalize_hop();
            entry.parent = Some(Box::new(parent));
        }
        tracing::trace!("pending HAR entry for {token} now has {} hop(s)", entry.hops());
        *slot = Slot::Pending(entry);
        true
    }

    fn take(&self, token: &CorrelationToken) -> Option<PendingEntry> {
        match self.slots.lock().remove(token) {
            Some(Slot::Pending(entry)) => Some(entry),
            Some(Slot::Reserved) | None => None,
        }
    }

    fn release(&self, token: &CorrelationToken) {
        if self.slots.lock().remove(token).is_some() {
            tracing::trace!("released pending HAR slot {token}");
        }
    }

    /// Number of reserved slots, with or without entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no slot is reserved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of a reserved slot in the [`PendingEntryTable`].
///
/// Dropping the guard, on error or when the fetch is cancelled,
/// discards whatever was recorded under its token.
#[derive(Debug)]
pub struct PendingGuard {
    table: PendingEntryTable,
    token: CorrelationToken,
}

impl PendingGuard {
    /// The token of the reserved slot.
    #[must_use]
    pub fn token(&self) -> &CorrelationToken {
        &self.token
    }

    /// Take the latest entry out of the table, releasing the slot.
    ///
    /// `None` if no physical request was recorded under the token.
    #[must_use]
    pub fn complete(self) -> Option<PendingEntry> {
        self.table.take(&self.token)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.release(&self.token);
    }
}
