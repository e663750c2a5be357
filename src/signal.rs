//! Per-target signal hub.
//!
//! A target reports what happens on the wire through typed signals rather
//! than a logging callback: a GUI, a console logger, or a test can
//! subscribe and react without the core knowing about any of them.
//! Emission is non-blocking and happens on the task that drives the
//! exchange, so subscribers observe signals in wire order.

use tokio::sync::broadcast;

use crate::error::ErrorKind;

/// Default capacity of the broadcast channel behind a [`SignalHub`].
pub const DEFAULT_SIGNAL_CAPACITY: usize = 64;

/// Notifications emitted by a target and its packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Something failed; `kind` selects the recovery policy.
    Error {
        /// Human-readable description.
        message: String,
        /// Propagation class of the failure.
        kind: ErrorKind,
    },
    /// No datagram arrived within the timeout; the target went offline.
    NoResponse {
        /// Human-readable description.
        message: String,
    },
    /// A status probe completed; the target is online.
    StatusOk,
    /// A read-class transaction delivered this many words.
    ReadSucceeded {
        /// Words delivered to the caller.
        words: u8,
    },
    /// A write-class transaction was applied to this many words.
    WriteSucceeded {
        /// Words the target reports written.
        words: u8,
    },
}

/// Fan-out point for [`Signal`]s.
///
/// Cheap to construct, never blocks on emit, and tolerates having no
/// subscribers at all (signals are then dropped).
#[derive(Debug)]
pub struct SignalHub {
    tx: broadcast::Sender<Signal>,
}

impl SignalHub {
    /// Create a hub with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SIGNAL_CAPACITY)
    }

    /// Create a hub buffering up to `capacity` unread signals per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all signals emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    /// Emit a signal to all current subscribers.
    pub fn emit(&self, signal: Signal) {
        // A send error only means nobody is listening.
        let _ = self.tx.send(signal);
    }

    /// Emit a [`Signal::Error`] with the given message and kind.
    pub fn emit_error(&self, message: impl Into<String>, kind: ErrorKind) {
        self.emit(Signal::Error {
            message: message.into(),
            kind,
        });
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let hub = SignalHub::new();
        hub.emit(Signal::StatusOk);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let hub = SignalHub::new();
        let mut rx = hub.subscribe();

        hub.emit(Signal::ReadSucceeded { words: 1 });
        hub.emit(Signal::WriteSucceeded { words: 2 });
        hub.emit_error("packet size exceeded", ErrorKind::Ipbus);

        assert_eq!(rx.recv().await.unwrap(), Signal::ReadSucceeded { words: 1 });
        assert_eq!(rx.recv().await.unwrap(), Signal::WriteSucceeded { words: 2 });
        assert_eq!(
            rx.recv().await.unwrap(),
            Signal::Error {
                message: "packet size exceeded".into(),
                kind: ErrorKind::Ipbus,
            }
        );
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_signals() {
        let hub = SignalHub::new();
        hub.emit(Signal::StatusOk);

        let mut rx = hub.subscribe();
        hub.emit(Signal::NoResponse {
            message: "no response from 127.0.0.1".into(),
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            Signal::NoResponse { .. }
        ));
        assert!(rx.try_recv().is_err());
    }
}
