//! Persistence verification workflow.
//!
//! Checks end to end that persistent messages survive a broker restart:
//!
//! 1. `publish_phase` declares a durable queue, publishes N persistent
//!    events with confirms and records their ids in a [`PublishState`] file.
//! 2. The broker is restarted out of band.
//! 3. `verify_phase` drains the queue and diffs what arrived against the
//!    recorded ids.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::event::BaseEvent;
use crate::publisher::{Publisher, PublisherConfig};
use crate::subscriber::{Subscriber, SubscriberConfig};
use crate::transport::ConsumeOptions;
use crate::utils::{EventError, Result};

pub const VERIFY_QUEUE: &str = "verify.persistence.queue";
pub const VERIFY_ROUTING_KEY: &str = "persistence.check";

/// What the publish phase sent, persisted between the two phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishState {
    pub run_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    /// Milliseconds since the UNIX epoch.
    pub published_at: i64,
    pub event_ids: Vec<String>,
}

impl PublishState {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(EventError::Deserialization)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self).map_err(EventError::Serialization)?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

/// Declares the verification queue and publishes `count` persistent events.
pub async fn publish_phase(
    manager: &Arc<ConnectionManager>,
    publisher_config: PublisherConfig,
    count: usize,
) -> Result<PublishState> {
    let exchange = publisher_config.exchange.clone();
    let queue = Subscriber::new(
        Arc::clone(manager),
        SubscriberConfig::new(VERIFY_QUEUE).bind(exchange.clone(), VERIFY_ROUTING_KEY),
    );
    queue.initialize().await?;

    let publisher = Publisher::new(Arc::clone(manager), publisher_config);
    publisher.initialize().await?;

    let run_id = Uuid::new_v4().to_string();
    let mut event_ids = Vec::with_capacity(count);
    for seq in 0..count {
        let event = publisher
            .publish(
                VERIFY_ROUTING_KEY,
                json!({ "runId": run_id, "seq": seq }),
                None,
            )
            .await?;
        debug!(event_id = %event.event_id, seq, "verification event confirmed");
        event_ids.push(event.event_id);
    }
    info!(run_id = %run_id, count, queue = VERIFY_QUEUE, "publish phase complete");

    Ok(PublishState {
        run_id,
        exchange,
        routing_key: VERIFY_ROUTING_KEY.to_string(),
        queue: VERIFY_QUEUE.to_string(),
        published_at: chrono::Utc::now().timestamp_millis(),
        event_ids,
    })
}

/// Drains `state.queue` until nothing arrives for `idle`, acking everything,
/// and compares the received ids with the recorded ones.
pub async fn verify_phase(
    manager: &Arc<ConnectionManager>,
    state: &PublishState,
    idle: Duration,
) -> Result<VerifyReport> {
    let channel = manager.get_channel().await?;
    let consumer_tag = format!("verify.{}", Uuid::new_v4().simple());
    let mut stream = channel
        .consume(
            &state.queue,
            ConsumeOptions {
                consumer_tag: consumer_tag.clone(),
                no_ack: false,
            },
        )
        .await?;

    let mut received = Vec::new();
    let mut seen = HashSet::new();
    let mut duplicates = 0;
    while let Ok(Some(delivery)) = tokio::time::timeout(idle, stream.next()).await {
        let delivery = delivery?;
        match BaseEvent::from_slice(&delivery.body) {
            Ok(event) => {
                if seen.insert(event.event_id.clone()) {
                    received.push(event.event_id);
                } else {
                    duplicates += 1;
                }
            }
            Err(e) => warn!(queue = %state.queue, error = %e, "skipping undecodable message"),
        }
        channel.ack(delivery.delivery_tag).await?;
    }
    channel.cancel(&consumer_tag).await?;
    channel.close().await?;

    let report = VerifyReport::compare(&state.event_ids, &received, duplicates);
    info!(
        run_id = %state.run_id,
        expected = report.expected,
        received = report.received,
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        "verify phase complete"
    );
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub expected: usize,
    /// Distinct ids received.
    pub received: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    /// Extra copies of an id already received (redeliveries).
    pub duplicates: usize,
}

impl VerifyReport {
    pub fn compare(expected: &[String], received: &[String], duplicates: usize) -> Self {
        let expected_set: HashSet<&String> = expected.iter().collect();
        let received_set: HashSet<&String> = received.iter().collect();
        Self {
            expected: expected.len(),
            received: received.len(),
            missing: expected
                .iter()
                .filter(|id| !received_set.contains(id))
                .cloned()
                .collect(),
            unexpected: received
                .iter()
                .filter(|id| !expected_set.contains(id))
                .cloned()
                .collect(),
            duplicates,
        }
    }

    /// The received id set equals the recorded one. Redelivered copies of a
    /// recorded id do not count against it.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_complete() { 0 } else { 1 }
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "expected {} / received {} (missing {}, unexpected {}, duplicates {})",
            self.expected,
            self.received,
            self.missing.len(),
            self.unexpected.len(),
            self.duplicates
        )?;
        for id in &self.missing {
            writeln!(f, "  missing: {id}")?;
        }
        for id in &self.unexpected {
            writeln!(f, "  unexpected: {id}")?;
        }
        write!(f, "{}", if self.is_complete() { "PASS" } else { "FAIL" })
    }
}
