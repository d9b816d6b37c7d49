use std::time::Duration;

use serde::Deserialize;

use crate::connection::{ConnectionConfig, DEFAULT_URL, ReconnectPolicy};
use crate::publisher::PublisherConfig;
use crate::subscriber::SubscriberConfig;
use crate::topology::DEFAULT_EXCHANGE;

/// Top-level configuration settings for the application.
///
/// One section per component: the broker connection, its reconnect policy,
/// publishers, subscribers, logging and the durable store of the in-memory
/// broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub reconnect: ReconnectSettings,
    pub publisher: PublisherSettings,
    pub subscriber: SubscriberSettings,
    pub log: LogSettings,
    pub store: StoreSettings,
}

/// Where and how to reach the AMQP broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub url: String,
    pub heartbeat_secs: u64,
    pub connection_name: String,
    pub connect_attempts: u32,
}

/// Backoff applied after an established connection drops.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub enabled: bool,
    /// 0 retries forever.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PublisherSettings {
    pub service: String,
    pub exchange: String,
    pub confirm_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SubscriberSettings {
    pub prefetch: u16,
    pub manual_ack: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Durable store of the in-memory broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StoreSettings {
    pub path: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub reconnect: Option<PartialReconnectSettings>,
    pub publisher: Option<PartialPublisherSettings>,
    pub subscriber: Option<PartialSubscriberSettings>,
    pub log: Option<PartialLogSettings>,
    pub store: Option<PartialStoreSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub url: Option<String>,
    pub heartbeat_secs: Option<u64>,
    pub connection_name: Option<String>,
    pub connect_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PartialReconnectSettings {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialPublisherSettings {
    pub service: Option<String>,
    pub exchange: Option<String>,
    pub confirm_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialSubscriberSettings {
    pub prefetch: Option<u16>,
    pub manual_ack: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
}

/// Development defaults; every value can be overridden from the config file
/// or the environment.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                url: DEFAULT_URL.to_string(),
                heartbeat_secs: 30,
                connection_name: "eventcore".to_string(),
                connect_attempts: 1,
            },
            reconnect: ReconnectSettings {
                enabled: true,
                max_retries: 10,
                initial_delay_ms: 1000,
                max_delay_ms: 30_000,
                multiplier: 2.0,
            },
            publisher: PublisherSettings {
                service: "eventcore".to_string(),
                exchange: DEFAULT_EXCHANGE.to_string(),
                confirm_timeout_ms: 5000,
            },
            subscriber: SubscriberSettings {
                prefetch: 10,
                manual_ack: true,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
            store: StoreSettings {
                path: "data/broker".to_string(),
            },
        }
    }
}

impl Settings {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.broker.url.clone(),
            heartbeat: Duration::from_secs(self.broker.heartbeat_secs),
            connection_name: self.broker.connection_name.clone(),
            connect_attempts: self.broker.connect_attempts.max(1),
            reconnect: ReconnectPolicy {
                enabled: self.reconnect.enabled,
                max_retries: (self.reconnect.max_retries > 0).then_some(self.reconnect.max_retries),
                initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                multiplier: self.reconnect.multiplier,
            },
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            service: self.publisher.service.clone(),
            exchange: self.publisher.exchange.clone(),
            confirm_timeout: Duration::from_millis(self.publisher.confirm_timeout_ms),
        }
    }

    /// Subscriber settings for `queue` with the configured prefetch and ack mode.
    pub fn subscriber_config(&self, queue: impl Into<String>) -> SubscriberConfig {
        let config = SubscriberConfig::new(queue).with_prefetch(self.subscriber.prefetch);
        if self.subscriber.manual_ack {
            config
        } else {
            config.auto_ack()
        }
    }
}
