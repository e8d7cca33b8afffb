use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::*;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::{spawn_sweep_loop, LeaseTable, LeaseToken};
use crate::{
    db_types::{Order, OrderId},
    traits::{
        CheckoutSession,
        OtpSubmission,
        PaymentProvider,
        PaymentProviderError,
        PaymentSubmission,
        ProgressFn,
        StopListener,
    },
};

/// Sessions that have been idle for longer than this are considered abandoned.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Error)]
pub enum SessionRegistryError {
    #[error("Order {0} is already being processed")]
    SessionActive(OrderId),
}

//--------------------------------------    SessionHandle    ---------------------------------------------------------
struct SessionInner {
    session: Box<dyn CheckoutSession>,
    closed: AtomicBool,
}

/// A shareable handle to an open checkout session. The underlying session is closed at most once, no matter how many
/// clones of the handle call [`SessionHandle::close`].
#[derive(Clone)]
pub struct SessionHandle {
    order_id: OrderId,
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    pub fn new(order_id: OrderId, session: Box<dyn CheckoutSession>) -> Self {
        let inner = SessionInner { session, closed: AtomicBool::new(false) };
        Self { order_id, inner: Arc::new(inner) }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn submit_payment(
        &self,
        order: &Order,
        on_progress: ProgressFn<'_>,
    ) -> Result<PaymentSubmission, PaymentProviderError> {
        if self.is_closed() {
            return Err(PaymentProviderError::SessionClosed);
        }
        self.inner.session.submit_payment(order, on_progress).await
    }

    pub async fn submit_otp(&self, otp: &str) -> Result<OtpSubmission, PaymentProviderError> {
        if self.is_closed() {
            return Err(PaymentProviderError::SessionClosed);
        }
        self.inner.session.submit_otp(otp).await
    }

    pub async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            trace!("🔐️ Closing checkout session for order {}", self.order_id);
            self.inner.session.close().await;
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("order_id", &self.order_id).field("closed", &self.is_closed()).finish()
    }
}

//--------------------------------------   SessionRegistry   ---------------------------------------------------------
/// Tracks which orders currently have an export run in flight, and the checkout session each one owns.
///
/// An order can be reserved only once at a time. Reservation happens before any side effect, so a duplicate change
/// event for an order that is already being exported is dropped without touching the record store or the provider.
#[derive(Clone)]
pub struct SessionRegistry {
    leases: LeaseTable<OrderId, Option<SessionHandle>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self { leases: LeaseTable::new(ttl) }
    }

    /// Claims the order for the caller. The claim is released when the returned lease is released or dropped.
    pub async fn reserve(&self, order_id: &OrderId) -> Result<SessionLease, SessionRegistryError> {
        let (token, evicted) = self
            .leases
            .try_acquire(order_id.clone(), None)
            .map_err(|_| SessionRegistryError::SessionActive(order_id.clone()))?;
        if let Some(Some(stale)) = evicted {
            warn!("🔐️ Order {order_id} had an abandoned checkout session. Closing it before starting again.");
            stale.close().await;
        }
        Ok(SessionLease { registry: self.clone(), order_id: order_id.clone(), token, session: None, released: false })
    }

    /// The live checkout session for the order, if there is one.
    pub fn session_for(&self, order_id: &OrderId) -> Option<SessionHandle> {
        self.leases.get(order_id).flatten()
    }

    pub fn is_active(&self, order_id: &OrderId) -> bool {
        self.leases.contains(order_id)
    }

    /// The number of orders currently reserved.
    pub fn active_count(&self) -> usize {
        self.leases.live_count()
    }

    /// Evicts expired reservations and closes any sessions they were holding.
    pub async fn sweep(&self) -> usize {
        let expired = self.leases.sweep_expired();
        let count = expired.len();
        for (order_id, session) in expired {
            if let Some(session) = session {
                warn!("🔐️ Checkout session for order {order_id} expired without being released. Closing it.");
                session.close().await;
            }
        }
        count
    }

    pub fn start_sweeper(&self, every: Duration, stop: StopListener) -> JoinHandle<()> {
        let registry = self.clone();
        spawn_sweep_loop("Session registry", every, stop, move || {
            let registry = registry.clone();
            async move { registry.sweep().await }
        })
    }
}

//--------------------------------------     SessionLease    ---------------------------------------------------------
/// Exclusive ownership of an order for the duration of one export run.
///
/// Call [`SessionLease::release`] when the run is over. If the lease is dropped instead (e.g. the task panicked or was
/// cancelled), the reservation is still removed and the session is closed in the background.
pub struct SessionLease {
    registry: SessionRegistry,
    order_id: OrderId,
    token: LeaseToken,
    session: Option<SessionHandle>,
    released: bool,
}

impl SessionLease {
    /// Opens a checkout session with the provider and records it against the order.
    pub async fn attach<P>(&mut self, provider: &P) -> Result<SessionHandle, PaymentProviderError>
    where P: PaymentProvider + ?Sized {
        let session = provider.new_payment(&self.order_id).await?;
        let handle = SessionHandle::new(self.order_id.clone(), session);
        if let Err(e) = self.registry.leases.update(&self.order_id, self.token, Some(handle.clone())) {
            warn!("🔐️ Could not record the checkout session for order {}: {e}", self.order_id);
        }
        self.session = Some(handle.clone());
        Ok(handle)
    }

    /// Removes the reservation and closes the session, if one was attached.
    pub async fn release(mut self) {
        self.released = true;
        let _ = self.registry.leases.release(&self.order_id, self.token);
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        trace!("🔐️ Released order {}", self.order_id);
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let _ = self.registry.leases.release(&self.order_id, self.token);
        if let Some(session) = self.session.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(async move { session.close().await });
                },
                Err(_) => {
                    warn!(
                        "🔐️ Lease for order {} dropped outside a runtime. The session cannot be closed.",
                        self.order_id
                    );
                },
            }
        }
    }
}
