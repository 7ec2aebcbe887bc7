//! Narrow trait boundary to the external Overlay Transport collaborator:
//! a small interface for the overlay (announce, send, receipt, handlers)
//! so the core is testable against an in-memory fake. Nothing in this
//! crate implements overlay routing, identity, or proof cryptography —
//! that is the collaborator's job; we only describe the shape of the
//! conversation.

use relay_types::DestinationHash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Opaque identity object owned by the Overlay Transport. We move it
/// around by value and hand it back unchanged on `send`; we never inspect
/// or construct its contents ourselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityHandle(pub Arc<[u8]>);

impl IdentityHandle {
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        IdentityHandle(bytes.into())
    }
}

/// Metadata accompanying an inbound payload delivered through
/// [`OverlayTransport::set_receive_callback`].
#[derive(Debug, Clone)]
pub struct PacketMeta {
    pub source: Option<DestinationHash>,
}

/// One `(destination_hash, identity, app_data)` announce tuple.
#[derive(Debug, Clone)]
pub struct AnnounceEvent {
    pub destination_hash: DestinationHash,
    pub identity: IdentityHandle,
    pub app_data: Vec<u8>,
}

pub type AnnounceHandler = Box<dyn Fn(AnnounceEvent) + Send + Sync>;
pub type ReceiveCallback = Box<dyn Fn(Vec<u8>, PacketMeta) + Send + Sync>;

#[derive(Debug, Error)]
pub enum OverlaySendError {
    #[error("send target has no identity")]
    PeerUnknown,
    #[error("overlay rejected the send attempt: {0}")]
    Rejected(String),
}

struct ReceiptState {
    on_delivery: Option<Box<dyn FnOnce() + Send>>,
    on_timeout: Option<Box<dyn FnOnce() + Send>>,
    timeout: Duration,
    settled: bool,
}

/// A handle to one in-flight unicast send. The Overlay Transport (real or
/// fake) resolves it exactly once, either as delivered or timed out;
/// retries are a new `send()` call producing a new `Receipt`, never a
/// retry on the same one.
#[derive(Clone)]
pub struct Receipt {
    state: Arc<Mutex<ReceiptState>>,
}

impl Receipt {
    pub fn new(default_timeout: Duration) -> Self {
        Receipt {
            state: Arc::new(Mutex::new(ReceiptState {
                on_delivery: None,
                on_timeout: None,
                timeout: default_timeout,
                settled: false,
            })),
        }
    }

    pub fn on_delivery(&self, f: impl FnOnce() + Send + 'static) {
        self.state.lock().expect("receipt mutex poisoned").on_delivery = Some(Box::new(f));
    }

    pub fn on_timeout(&self, f: impl FnOnce() + Send + 'static) {
        self.state.lock().expect("receipt mutex poisoned").on_timeout = Some(Box::new(f));
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.state.lock().expect("receipt mutex poisoned").timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.state.lock().expect("receipt mutex poisoned").timeout
    }

    /// Called by the transport on proof arrival. A no-op if already settled.
    pub fn resolve_delivered(&self) {
        let callback = {
            let mut state = self.state.lock().expect("receipt mutex poisoned");
            if state.settled {
                return;
            }
            state.settled = true;
            state.on_delivery.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Called by the transport when `timeout()` elapses with no proof. A
    /// no-op if already settled (proof arrived first).
    pub fn resolve_timed_out(&self) {
        let callback = {
            let mut state = self.state.lock().expect("receipt mutex poisoned");
            if state.settled {
                return;
            }
            state.settled = true;
            state.on_timeout.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// What we consume from the Overlay Transport. Out of scope: identities,
/// routing, link establishment, proof mechanics — all of that lives behind
/// this trait in the real overlay library.
pub trait OverlayTransport: Send + Sync {
    /// Advertise our hostname (or other `app_data`) to the overlay.
    fn announce(&self, app_data: &[u8]);

    /// Register the callback invoked for every inbound announce tuple.
    /// Bound once at startup by the Peer Directory.
    fn register_announce_handler(&self, handler: AnnounceHandler);

    /// Unicast-send `bytes` to `identity`. A `Rejected` error is
    /// transient, retried through the caller's own schedule rather than
    /// becoming a property of the returned `Receipt`.
    fn send(&self, identity: &IdentityHandle, bytes: &[u8]) -> Result<Receipt, OverlaySendError>;

    /// Bound once at startup by the Ingress Router; delivers inbound
    /// payloads as they arrive.
    fn set_receive_callback(&self, callback: ReceiveCallback);
}

struct SentRecord {
    identity: IdentityHandle,
    bytes: Vec<u8>,
    receipt: Receipt,
}

/// In-memory [`OverlayTransport`] for unit and integration tests. Lets
/// every higher component (Peer Directory, Path Controller's consumers,
/// Reliable Sender, Ingress Router) be exercised without a real overlay
/// stack.
#[derive(Default)]
pub struct FakeOverlay {
    announce_handler: Mutex<Option<AnnounceHandler>>,
    receive_callback: Mutex<Option<ReceiveCallback>>,
    announced: Mutex<Vec<Vec<u8>>>,
    sent: Mutex<Vec<SentRecord>>,
    reject_next: Mutex<bool>,
}

impl FakeOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `send()` call fail with `Rejected`, simulating a
    /// transient overlay-side rejection.
    pub fn reject_next_send(&self) {
        *self.reject_next.lock().expect("reject flag poisoned") = true;
    }

    pub fn announced(&self) -> Vec<Vec<u8>> {
        self.announced.lock().expect("announced poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent poisoned").len()
    }

    pub fn sent_bytes(&self, index: usize) -> Option<Vec<u8>> {
        self.sent.lock().expect("sent poisoned").get(index).map(|record| record.bytes.clone())
    }

    pub fn sent_identity(&self, index: usize) -> Option<IdentityHandle> {
        self.sent.lock().expect("sent poisoned").get(index).map(|record| record.identity.clone())
    }

    /// Resolves the `index`-th send as delivered.
    pub fn deliver(&self, index: usize) {
        let receipt = self.sent.lock().expect("sent poisoned").get(index).map(|r| r.receipt.clone());
        if let Some(receipt) = receipt {
            receipt.resolve_delivered();
        }
    }

    /// Resolves the `index`-th send as timed out.
    pub fn time_out(&self, index: usize) {
        let receipt = self.sent.lock().expect("sent poisoned").get(index).map(|r| r.receipt.clone());
        if let Some(receipt) = receipt {
            receipt.resolve_timed_out();
        }
    }

    pub fn simulate_announce(&self, event: AnnounceEvent) {
        if let Some(handler) = self.announce_handler.lock().expect("handler poisoned").as_ref() {
            handler(event);
        }
    }

    pub fn simulate_inbound(&self, bytes: Vec<u8>, meta: PacketMeta) {
        if let Some(callback) = self.receive_callback.lock().expect("callback poisoned").as_ref() {
            callback(bytes, meta);
        }
    }
}

impl OverlayTransport for FakeOverlay {
    fn announce(&self, app_data: &[u8]) {
        self.announced.lock().expect("announced poisoned").push(app_data.to_vec());
    }

    fn register_announce_handler(&self, handler: AnnounceHandler) {
        *self.announce_handler.lock().expect("handler poisoned") = Some(handler);
    }

    fn send(&self, identity: &IdentityHandle, bytes: &[u8]) -> Result<Receipt, OverlaySendError> {
        let mut reject = self.reject_next.lock().expect("reject flag poisoned");
        if *reject {
            *reject = false;
            return Err(OverlaySendError::Rejected("fake overlay rejected by test".into()));
        }
        drop(reject);
        let receipt = Receipt::new(Duration::from_secs(relay_types::PACKET_TIMEOUT_SECS));
        self.sent.lock().expect("sent poisoned").push(SentRecord {
            identity: identity.clone(),
            bytes: bytes.to_vec(),
            receipt: receipt.clone(),
        });
        Ok(receipt)
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) {
        *self.receive_callback.lock().expect("callback poisoned") = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn delivered_fires_on_delivery_not_on_timeout() {
        let overlay = FakeOverlay::new();
        let identity = IdentityHandle::from_bytes(vec![1u8; 16]);
        let receipt = overlay.send(&identity, b"payload").expect("send");
        let delivered = Arc::new(AtomicBool::new(false));
        let timed_out = Arc::new(AtomicBool::new(false));
        {
            let delivered = delivered.clone();
            receipt.on_delivery(move || delivered.store(true, Ordering::SeqCst));
        }
        {
            let timed_out = timed_out.clone();
            receipt.on_timeout(move || timed_out.store(true, Ordering::SeqCst));
        }

        overlay.deliver(0);
        assert!(delivered.load(Ordering::SeqCst));
        assert!(!timed_out.load(Ordering::SeqCst));

        // A late timeout after delivery must not fire.
        overlay.time_out(0);
        assert!(!timed_out.load(Ordering::SeqCst));
    }

    #[test]
    fn rejected_send_does_not_record_a_sent_entry() {
        let overlay = FakeOverlay::new();
        overlay.reject_next_send();
        let identity = IdentityHandle::from_bytes(vec![2u8; 16]);
        let result = overlay.send(&identity, b"x");
        assert!(matches!(result, Err(OverlaySendError::Rejected(_))));
        assert_eq!(overlay.sent_count(), 0);
    }

    #[test]
    fn announce_handler_receives_simulated_events() {
        let overlay = FakeOverlay::new();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            overlay.register_announce_handler(Box::new(move |event| {
                *seen.lock().unwrap() = Some(event.app_data);
            }));
        }
        overlay.simulate_announce(AnnounceEvent {
            destination_hash: DestinationHash([9u8; 16]),
            identity: IdentityHandle::from_bytes(vec![9u8; 16]),
            app_data: b"node-b".to_vec(),
        });
        assert_eq!(seen.lock().unwrap().as_deref(), Some(&b"node-b"[..]));
    }
}
