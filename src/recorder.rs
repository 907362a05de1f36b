//! Sinks for finalized entries.

use crate::spec::{Entry, Har};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A [`Har`] document shared between the caller and the fetch layer,
/// which appends finalized entries into it.
///
/// Cloning gives another handle to the same document.
#[derive(Clone)]
pub struct SharedHarLog {
    har: Arc<Mutex<Har>>,
}

impl SharedHarLog {
    /// Share the given document.
    #[must_use]
    pub fn new(har: Har) -> Self {
        Self {
            har: Arc::new(Mutex::new(har)),
        }
    }

    /// Append entries to the end of the log, in the given order.
    pub fn append(&self, entries: impl IntoIterator<Item = Entry>) {
        self.har.lock().log.entries.extend(entries);
    }

    /// A copy of the document as it is right now.
    #[must_use]
    pub fn snapshot(&self) -> Har {
        self.har.lock().clone()
    }

    /// Number of entries in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.har.lock().log.entries.len()
    }

    /// Whether the log has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SharedHarLog {
    fn default() -> Self {
        Self::new(Har::new(Vec::new()))
    }
}

impl From<Har> for SharedHarLog {
    fn from(har: Har) -> Self {
        Self::new(har)
    }
}

impl fmt::Debug for SharedHarLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHarLog")
            .field("entries", &self.len())
            .finish()
    }
}

/// Callback invoked once for every finalized entry, redirect hops included.
pub trait OnEntry: Send + Sync + 'static {
    /// Called with a finalized entry.
    fn on_entry(&self, entry: &Entry);
}

impl<F> OnEntry for F
where
    F: Fn(&Entry) + Send + Sync + 'static,
{
    fn on_entry(&self, entry: &Entry) {
        self(entry)
    }
}

impl OnEntry for SharedHarLog {
    fn on_entry(&self, entry: &Entry) {
        self.append([entry.clone()]);
    }
}
