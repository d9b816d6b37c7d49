mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BrokerSettings, LogSettings, PublisherSettings, ReconnectSettings, Settings, StoreSettings,
    SubscriberSettings,
};

/// Environment prefix; `EVENTCORE_BROKER__URL` sets `broker.url`.
pub const ENV_PREFIX: &str = "EVENTCORE";

/// Loads the configuration from `.env`, the default file and environment
/// variables, and merges it with default values.
///
/// `AMQP_URL` is used for the broker URL when `broker.url` is not set
/// anywhere else.
pub fn load_config() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial))
}

fn merge(partial: PartialSettings) -> Settings {
    let default = Settings::default();

    Settings {
        broker: BrokerSettings {
            url: partial
                .broker
                .as_ref()
                .and_then(|b| b.url.clone())
                .or_else(|| std::env::var("AMQP_URL").ok().filter(|url| !url.is_empty()))
                .unwrap_or(default.broker.url),
            heartbeat_secs: partial
                .broker
                .as_ref()
                .and_then(|b| b.heartbeat_secs)
                .unwrap_or(default.broker.heartbeat_secs),
            connection_name: partial
                .broker
                .as_ref()
                .and_then(|b| b.connection_name.clone())
                .unwrap_or(default.broker.connection_name),
            connect_attempts: partial
                .broker
                .as_ref()
                .and_then(|b| b.connect_attempts)
                .unwrap_or(default.broker.connect_attempts),
        },
        reconnect: ReconnectSettings {
            enabled: partial
                .reconnect
                .as_ref()
                .and_then(|r| r.enabled)
                .unwrap_or(default.reconnect.enabled),
            max_retries: partial
                .reconnect
                .as_ref()
                .and_then(|r| r.max_retries)
                .unwrap_or(default.reconnect.max_retries),
            initial_delay_ms: partial
                .reconnect
                .as_ref()
                .and_then(|r| r.initial_delay_ms)
                .unwrap_or(default.reconnect.initial_delay_ms),
            max_delay_ms: partial
                .reconnect
                .as_ref()
                .and_then(|r| r.max_delay_ms)
                .unwrap_or(default.reconnect.max_delay_ms),
            multiplier: partial
                .reconnect
                .as_ref()
                .and_then(|r| r.multiplier)
                .unwrap_or(default.reconnect.multiplier),
        },
        publisher: PublisherSettings {
            service: partial
                .publisher
                .as_ref()
                .and_then(|p| p.service.clone())
                .unwrap_or(default.publisher.service),
            exchange: partial
                .publisher
                .as_ref()
                .and_then(|p| p.exchange.clone())
                .unwrap_or(default.publisher.exchange),
            confirm_timeout_ms: partial
                .publisher
                .as_ref()
                .and_then(|p| p.confirm_timeout_ms)
                .unwrap_or(default.publisher.confirm_timeout_ms),
        },
        subscriber: SubscriberSettings {
            prefetch: partial
                .subscriber
                .as_ref()
                .and_then(|s| s.prefetch)
                .unwrap_or(default.subscriber.prefetch),
            manual_ack: partial
                .subscriber
                .as_ref()
                .and_then(|s| s.manual_ack)
                .unwrap_or(default.subscriber.manual_ack),
        },
        log: LogSettings {
            level: partial
                .log
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.log.level),
        },
        store: StoreSettings {
            path: partial
                .store
                .as_ref()
                .and_then(|s| s.path.clone())
                .unwrap_or(default.store.path),
        },
    }
}

#[cfg(test)]
mod tests;
