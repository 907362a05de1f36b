//! Per-request milestone tracking and the derived HAR [`Timings`].
//!
//! All milestones are taken from a monotonic clock ([`Instant`]),
//! wall-clock time is only used for `startedDateTime`.

use crate::spec::Timings;
use std::time::Instant;

/// Lower bound for `blocked`.
///
/// Chrome's network panel renders the `wait` phase as "stalled"
/// when `blocked` is not strictly positive.
pub const MIN_BLOCKED_MS: f64 = 0.01;

/// A milestone in the lifecycle of a single physical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Milestone {
    /// A connection (new or reused) was assigned to the request.
    SocketAcquired,
    /// The host name was resolved.
    DnsLookup,
    /// The connection was established.
    Connected,
    /// The TLS handshake finished.
    SecureConnected,
    /// The request, body included, was fully written.
    RequestSent,
    /// The response head arrived.
    FirstResponseByte,
    /// The response body was fully consumed.
    BodyReceived,
}

/// Timestamps of the [`Milestone`]s of a single physical request.
///
/// Only `start` is always present. A milestone is recorded at most once:
/// recording it again keeps the first value.
#[derive(Debug, Clone, Copy)]
pub struct TimestampSet {
    start: Instant,
    socket_acquired: Option<Instant>,
    dns_lookup: Option<Instant>,
    connected: Option<Instant>,
    secure_connected: Option<Instant>,
    request_sent: Option<Instant>,
    first_response_byte: Option<Instant>,
    body_received: Option<Instant>,
}

impl TimestampSet {
    /// Start tracking a request now.
    #[must_use]
    pub fn begin() -> Self {
        Self::begin_at(Instant::now())
    }

    /// Start tracking a request that started at the given instant.
    #[must_use]
    pub fn begin_at(start: Instant) -> Self {
        Self {
            start,
            socket_acquired: None,
            dns_lookup: None,
            connected: None,
            secure_connected: None,
            request_sent: None,
            first_response_byte: None,
            body_received: None,
        }
    }

    /// Instant at which tracking started.
    #[must_use]
    pub fn start(&self) -> Instant {
        self.start
    }

    /// Record the milestone now, unless it was recorded before.
    pub fn record(&mut self, milestone: Milestone) {
        self.record_at(milestone, Instant::now());
    }

    /// Record the milestone at the given instant, unless it was recorded before.
    pub fn record_at(&mut self, milestone: Milestone, at: Instant) {
        let slot = self.slot_mut(milestone);
        if slot.is_none() {
            *slot = Some(at);
        }
    }

    /// Get the instant at which the milestone was recorded, if it was.
    #[must_use]
    pub fn get(&self, milestone: Milestone) -> Option<Instant> {
        match milestone {
            Milestone::SocketAcquired => self.socket_acquired,
            Milestone::DnsLookup => self.dns_lookup,
            Milestone::Connected => self.connected,
            Milestone::SecureConnected => self.secure_connected,
            Milestone::RequestSent => self.request_sent,
            Milestone::FirstResponseByte => self.first_response_byte,
            Milestone::BodyReceived => self.body_received,
        }
    }

    fn slot_mut(&mut self, milestone: Milestone) -> &mut Option<Instant> {
        match milestone {
            Milestone::SocketAcquired => &mut self.socket_acquired,
            Milestone::DnsLookup => &mut self.dns_lookup,
            Milestone::Connected => &mut self.connected,
            Milestone::SecureConnected => &mut self.secure_connected,
            Milestone::RequestSent => &mut self.request_sent,
            Milestone::FirstResponseByte => &mut self.first_response_byte,
            Milestone::BodyReceived => &mut self.body_received,
        }
    }

    /// Back-fill skipped milestones and compute the HAR timings.
    ///
    /// Resolution and connection milestones that never fired (cached DNS,
    /// reused connection) take the value of the milestone before them.
    /// `connect` includes the TLS handshake, which is also reported on its own
    /// as `ssl`, for compatibility with HAR 1.1 consumers.
    pub fn finalize(&mut self) -> Timings {
        let socket_acquired = *self.socket_acquired.get_or_insert(self.start);
        let dns_lookup = *self.dns_lookup.get_or_insert(socket_acquired);
        let connected = *self.connected.get_or_insert(dns_lookup);
        let established = self.secure_connected.unwrap_or(connected);
        let request_sent = *self.request_sent.get_or_insert(established);
        let first_response_byte = *self.first_response_byte.get_or_insert(request_sent);
        let body_received = *self.body_received.get_or_insert(first_response_byte);

        Timings {
            blocked: duration_ms(self.start, socket_acquired).max(MIN_BLOCKED_MS),
            dns: duration_ms(socket_acquired, dns_lookup),
            connect: duration_ms(dns_lookup, established),
            send: duration_ms(established, request_sent),
            wait: duration_ms(request_sent, first_response_byte).max(0.0),
            receive: duration_ms(first_response_byte, body_received),
            ssl: match self.secure_connected {
                Some(secure_connected) => duration_ms(connected, secure_connected),
                None => -1.0,
            },
            comment: None,
        }
    }

    /// Total time of the request in milliseconds, from start until the body
    /// was received (or the latest milestone recorded so far).
    #[must_use]
    pub fn total_ms(&self) -> f64 {
        let end = self
            .body_received
            .or(self.first_response_byte)
            .or(self.request_sent)
            .unwrap_or(self.start);
        duration_ms(self.start, end)
    }
}

/// Signed duration between two instants, in milliseconds.
fn duration_ms(from: Instant, to: Instant) -> f64 {
    match to.checked_duration_since(from) {
        Some(elapsed) => elapsed.as_secs_f64() * 1000.0,
        None => -(from.saturating_duration_since(to).as_secs_f64() * 1000.0),
    }
}
