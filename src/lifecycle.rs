//! One-shot observers for the lifecycle events of a physical request.
//!
//! A transport reports progress by emitting [`LifecycleEvent`]s on two hubs:
//!
//! - the [`Lifecycle`] found in the request extensions, for
//!   [`LifecycleEvent::SocketAcquired`] and [`LifecycleEvent::RequestSent`];
//! - the [`Lifecycle`] of the [`Connection`] that was assigned, for
//!   [`LifecycleEvent::DnsResolved`], [`LifecycleEvent::Connected`] and
//!   [`LifecycleEvent::SecureConnected`].
//!
//! Connection level events only fire for fresh connections, a transport that
//! reuses a kept-alive connection (or a pre-resolved host) skips them.
//!
//! Listeners fire at most once and are deregistered when they fire.
//!
//! # Example
//!
//! ```
//! use rama_har::lifecycle::{Connection, EventKind, Lifecycle, LifecycleEvent};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let lifecycle = Lifecycle::new();
//! let fired = Arc::new(AtomicUsize::new(0));
//!
//! let counter = fired.clone();
//! lifecycle.once(EventKind::RequestSent, move |_| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! lifecycle.emit(&LifecycleEvent::RequestSent);
//! lifecycle.emit(&LifecycleEvent::RequestSent);
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! assert_eq!(lifecycle.listener_count(), 0);
//! ```

use http::Request;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// An event in the lifecycle of a physical request.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A connection was assigned to the request.
    SocketAcquired(Connection),
    /// The host name of a fresh connection was resolved.
    DnsResolved,
    /// A fresh connection was established.
    Connected,
    /// The TLS handshake of a fresh connection finished.
    SecureConnected,
    /// The request was fully written.
    RequestSent,
}

impl LifecycleEvent {
    /// The [`EventKind`] of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SocketAcquired(_) => EventKind::SocketAcquired,
            Self::DnsResolved => EventKind::DnsResolved,
            Self::Connected => EventKind::Connected,
            Self::SecureConnected => EventKind::SecureConnected,
            Self::RequestSent => EventKind::RequestSent,
        }
    }
}

/// Discriminant of a [`LifecycleEvent`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SocketAcquired,
    DnsResolved,
    Connected,
    SecureConnected,
    RequestSent,
}

/// Identifies a registered listener, see [`Lifecycle::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Box<dyn FnOnce(&LifecycleEvent) + Send + 'static>;

struct Listener {
    id: ListenerId,
    kind: EventKind,
    callback: Callback,
}

/// Hub on which [`LifecycleEvent`]s are emitted and observed.
///
/// Cloning gives another handle to the same hub.
#[derive(Clone, Default)]
pub struct Lifecycle {
    listeners: Arc<Mutex<Vec<Listener>>>,
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(0);

impl Lifecycle {
    /// Create a new [`Lifecycle`] without listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the [`Lifecycle`] of the request, if it has one.
    pub fn of<B>(req: &Request<B>) -> Option<&Self> {
        req.extensions().get::<Self>()
    }

    /// Register a listener that is invoked for the next event of the given kind,
    /// after which it is deregistered.
    pub fn once<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: FnOnce(&LifecycleEvent) + Send + 'static,
    {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(Listener {
            id,
            kind,
            callback: Box::new(callback),
        });
        id
    }

    /// Deregister a listener that has not fired yet.
    ///
    /// Returns `false` if it already fired or was removed before.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        match listeners.iter().position(|listener| listener.id == id) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    /// Emit an event, invoking (and deregistering) all listeners for its kind,
    /// in registration order.
    ///
    /// Listeners are invoked without holding any lock, they are free to
    /// register or remove listeners on any hub, this one included.
    /// Returns the number of listeners invoked.
    pub fn emit(&self, event: &LifecycleEvent) -> usize {
        let kind = event.kind();
        let fired: Vec<Listener> = {
            let mut listeners = self.listeners.lock();
            let (fired, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *listeners)
                .into_iter()
                .partition(|listener| listener.kind == kind);
            *listeners = rest;
            fired
        };

        let count = fired.len();
        for listener in fired {
            (listener.callback)(event);
        }
        count
    }

    /// Number of listeners that have not fired yet.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// A (possibly shared) connection assigned to one or more requests.
#[derive(Clone)]
pub struct Connection {
    id: u64,
    lifecycle: Lifecycle,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl Connection {
    /// Create a new [`Connection`] handle, with a unique id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Id of the connection, unique within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The hub for the connection level events.
    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_fire_at_most_once() {
        let lifecycle = Lifecycle::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        lifecycle.once(EventKind::Connected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(lifecycle.emit(&LifecycleEvent::DnsResolved), 0);
        assert_eq!(lifecycle.listener_count(), 1);

        assert_eq!(lifecycle.emit(&LifecycleEvent::Connected), 1);
        assert_eq!(lifecycle.emit(&LifecycleEvent::Connected), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.listener_count(), 0);
    }

    #[test]
    fn removed_listener_never_fires() {
        let lifecycle = Lifecycle::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let id = lifecycle.once(EventKind::SecureConnected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(lifecycle.remove(id));
        assert!(!lifecycle.remove(id));
        lifecycle.emit(&LifecycleEvent::SecureConnected);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_can_register_on_connection_hub() {
        let request = Lifecycle::new();
        let connection = Connection::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        request.once(EventKind::SocketAcquired, move |event| {
            if let LifecycleEvent::SocketAcquired(conn) = event {
                conn.lifecycle().once(EventKind::DnsResolved, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        request.emit(&LifecycleEvent::SocketAcquired(connection.clone()));
        assert_eq!(connection.lifecycle().listener_count(), 1);
        connection.lifecycle().emit(&LifecycleEvent::DnsResolved);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_can_reenter_its_own_hub() {
        let lifecycle = Lifecycle::new();
        let inner = lifecycle.clone();
        lifecycle.once(EventKind::RequestSent, move |_| {
            inner.once(EventKind::RequestSent, |_| {});
        });

        assert_eq!(lifecycle.emit(&LifecycleEvent::RequestSent), 1);
        assert_eq!(lifecycle.listener_count(), 1);
    }

    #[test]
    fn connections_have_unique_ids() {
        let a = Connection::new();
        let b = Connection::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn request_extension_lookup() {
        let lifecycle = Lifecycle::new();
        let mut req = Request::new(());
        assert!(Lifecycle::of(&req).is_none());
        req.extensions_mut().insert(lifecycle.clone());

        let found = Lifecycle::of(&req).unwrap();
        found.once(EventKind::RequestSent, |_| {});
        assert_eq!(lifecycle.listener_count(), 1);
    }
}
