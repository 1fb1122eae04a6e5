use anyhow::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::identity::DeviceIdentity;
use crate::protocol::{Message, PairRequest, PairResponse};
use crate::session::{ConnectionHandle, SessionEvent};
use crate::trust::{TrustStore, TrustedPeer};
use crate::util::now_millis;

pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(60);

/// An unanswered pairing request. Exists only between receipt of
/// `pair_request` and the operator's verdict (or the decision timeout).
#[derive(Debug, Clone)]
pub struct PairingRequest {
    pub connection_id: Uuid,
    pub device_id: String,
    pub device_name: String,
    pub pin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedPairing {
    pub connection_id: Uuid,
    pub device_id: String,
    pub device_name: String,
    pub accepted: bool,
}

struct QueuedRequest {
    seq: u64,
    handle: ConnectionHandle,
    request: PairingRequest,
}

/// Turns unauthenticated sessions into trusted peers. Requests queue FIFO;
/// exactly one is surfaced to the operator at a time, and a later request
/// never displaces the surfaced one without operator action. A surfaced
/// request left undecided past the decision timeout is auto-rejected so it
/// cannot stall the queue behind it.
pub struct PairingAuthority {
    identity: DeviceIdentity,
    trust: Arc<TrustStore>,
    decision_timeout: Duration,
    queue: Mutex<VecDeque<QueuedRequest>>,
    next_seq: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl PairingAuthority {
    pub fn new(
        identity: DeviceIdentity,
        trust: Arc<TrustStore>,
        decision_timeout: Duration,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            identity,
            trust,
            decision_timeout,
            queue: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            events,
        }
    }

    /// Queue an inbound request. Returns the request if it became the
    /// surfaced one (i.e. the queue was empty); surfacing emits
    /// [`SessionEvent::PairingRequested`] and arms the decision timer.
    pub fn submit(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        request: PairRequest,
    ) -> Option<PairingRequest> {
        let pending = PairingRequest {
            connection_id: handle.id,
            device_id: request.device_id,
            device_name: request.device_name,
            pin: request.pin,
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let surfaced = {
            let mut queue = self.queue.lock();
            let surfaced = queue.is_empty();
            queue.push_back(QueuedRequest {
                seq,
                handle,
                request: pending.clone(),
            });
            surfaced
        };
        tracing::info!(
            "pairing request from {} ({}){}",
            pending.device_name,
            pending.device_id,
            if surfaced { "" } else { ", queued" }
        );
        if surfaced {
            self.arm_timer(seq);
            let _ = self
                .events
                .send(SessionEvent::PairingRequested(pending.clone()));
        }
        surfaced.then_some(pending)
    }

    /// The request currently awaiting the operator, if any.
    pub fn pending(&self) -> Option<PairingRequest> {
        self.queue.lock().front().map(|q| q.request.clone())
    }

    /// Operator accepted the surfaced request. Replies on its connection
    /// and, when `remember` is set, persists a trusted-peer entry. The
    /// peer's address stays unset until a discovery scan matches it.
    pub fn accept(
        self: &Arc<Self>,
        remember: bool,
        auto_connect: bool,
    ) -> Result<Option<ResolvedPairing>> {
        let Some(QueuedRequest { handle, request, .. }) = self.queue.lock().pop_front() else {
            return Ok(None);
        };

        if remember {
            self.trust.upsert(TrustedPeer {
                device_id: request.device_id.clone(),
                device_name: request.device_name.clone(),
                last_address: None,
                auto_connect,
                paired_at: now_millis(),
            })?;
        }

        let response = Message::PairResponse(PairResponse {
            accepted: true,
            device_id: Some(self.identity.device_id.clone()),
            device_name: Some(self.identity.device_name.clone()),
        });
        if let Err(e) = handle.send(response) {
            tracing::warn!("pairing accepted but peer is gone: {e}");
        }

        tracing::info!("paired with {} ({})", request.device_name, request.device_id);
        self.surface_next();
        Ok(Some(ResolvedPairing {
            connection_id: request.connection_id,
            device_id: request.device_id,
            device_name: request.device_name,
            accepted: true,
        }))
    }

    /// Operator rejected the surfaced request. No trust is created.
    pub fn reject(self: &Arc<Self>) -> Result<Option<ResolvedPairing>> {
        let Some(QueuedRequest { handle, request, .. }) = self.queue.lock().pop_front() else {
            return Ok(None);
        };

        send_rejection(&handle);
        self.surface_next();
        Ok(Some(ResolvedPairing {
            connection_id: request.connection_id,
            device_id: request.device_id,
            device_name: request.device_name,
            accepted: false,
        }))
    }

    /// Discard everything pending, without replies. Used on mode switch.
    /// Stale decision timers find a non-matching queue front and no-op.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    fn arm_timer(self: &Arc<Self>, seq: u64) {
        let authority = Arc::clone(self);
        let deadline = self.decision_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            authority.expire(seq);
        });
    }

    /// Auto-reject the surfaced request if it is still the one the timer
    /// was armed for.
    fn expire(self: &Arc<Self>, seq: u64) {
        let timed_out = {
            let mut queue = self.queue.lock();
            match queue.front() {
                Some(front) if front.seq == seq => queue.pop_front(),
                _ => None,
            }
        };
        let Some(QueuedRequest { handle, request, .. }) = timed_out else {
            return;
        };

        tracing::warn!(
            "pairing request from {} timed out without a decision",
            request.device_name
        );
        send_rejection(&handle);
        let _ = self.events.send(SessionEvent::PairingResolved {
            connection_id: request.connection_id,
            accepted: false,
            device_id: Some(request.device_id),
        });
        self.surface_next();
    }

    /// Surface the new queue front after a pop: arm its timer and notify
    /// the operator layer.
    fn surface_next(self: &Arc<Self>) {
        let surfaced = {
            let queue = self.queue.lock();
            queue.front().map(|q| (q.seq, q.request.clone()))
        };
        if let Some((seq, request)) = surfaced {
            self.arm_timer(seq);
            let _ = self.events.send(SessionEvent::PairingRequested(request));
        }
    }
}

fn send_rejection(handle: &ConnectionHandle) {
    let response = Message::PairResponse(PairResponse {
        accepted: false,
        device_id: None,
        device_name: None,
    });
    if let Err(e) = handle.send(response) {
        tracing::debug!("pairing rejection not deliverable: {e}");
    }
}
