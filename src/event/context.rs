use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, warn};

use crate::transport::{BrokerChannel, RawDelivery};
use crate::utils::Result;

const PENDING: u8 = 0;
const ACKED: u8 = 1;
const REQUEUED: u8 = 2;
const REJECTED: u8 = 3;
const AUTO_ACKED: u8 = 4;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked { requeue: bool },
    /// The consumer runs without acknowledgements; the broker already
    /// forgot the message when it was delivered.
    AutoAcked,
}

/// Per-delivery acknowledgement handle handed to a subscriber handler.
///
/// The first `ack`/`nack` settles the delivery; any later call is a no-op and
/// never reaches the broker. Clones share the same settlement state.
#[derive(Clone)]
pub struct EventContext {
    inner: Arc<Inner>,
}

struct Inner {
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
    routing_key: String,
    redelivered: bool,
    state: AtomicU8,
}

impl EventContext {
    pub(crate) fn new(
        channel: Arc<dyn BrokerChannel>,
        delivery: &RawDelivery,
        manual_ack: bool,
    ) -> Self {
        let state = if manual_ack { PENDING } else { AUTO_ACKED };
        Self {
            inner: Arc::new(Inner {
                channel,
                delivery_tag: delivery.delivery_tag,
                routing_key: delivery.routing_key.clone(),
                redelivered: delivery.redelivered,
                state: AtomicU8::new(state),
            }),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    pub fn routing_key(&self) -> &str {
        &self.inner.routing_key
    }

    /// True when the broker has delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    /// Marks the delivery as processed so the broker removes it.
    pub async fn ack(&self) -> Result<()> {
        if !self.settle(ACKED) {
            return Ok(());
        }
        self.inner.channel.ack(self.inner.delivery_tag).await?;
        Ok(())
    }

    /// Rejects the delivery. With `requeue = false` the broker dead-letters
    /// it when the queue has a dead-letter exchange, otherwise drops it.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        let next = if requeue { REQUEUED } else { REJECTED };
        if !self.settle(next) {
            return Ok(());
        }
        self.inner
            .channel
            .nack(self.inner.delivery_tag, requeue)
            .await?;
        Ok(())
    }

    pub fn settlement(&self) -> Option<Settlement> {
        match self.inner.state.load(Ordering::Acquire) {
            ACKED => Some(Settlement::Acked),
            REQUEUED => Some(Settlement::Nacked { requeue: true }),
            REJECTED => Some(Settlement::Nacked { requeue: false }),
            AUTO_ACKED => Some(Settlement::AutoAcked),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settlement().is_some()
    }

    fn settle(&self, next: u8) -> bool {
        match self
            .inner
            .state
            .compare_exchange(PENDING, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(AUTO_ACKED) => {
                debug!(
                    delivery_tag = self.inner.delivery_tag,
                    "ack/nack ignored for auto-ack delivery"
                );
                false
            }
            Err(_) => {
                warn!(
                    delivery_tag = self.inner.delivery_tag,
                    "delivery already settled; ignoring repeated ack/nack"
                );
                false
            }
        }
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("delivery_tag", &self.inner.delivery_tag)
            .field("routing_key", &self.inner.routing_key)
            .field("redelivered", &self.inner.redelivered)
            .field("settlement", &self.settlement())
            .finish()
    }
}
