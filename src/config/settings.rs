use serde::Deserialize;

/// Top-level configuration settings for the engine.
///
/// Includes settings for the durable store, the delivery engine and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub store: StoreSettings,
    pub delivery: DeliverySettings,
    pub log: LogSettings,
}

/// Where the durable queue store keeps its data.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub data_dir: String,
}

/// Configuration settings for fan-out and retries.
///
/// `workers` and `queue_capacity` bound the first-attempt worker pool;
/// the timeouts bound every outbound subscriber call.
#[derive(Debug, Deserialize, Clone)]
pub struct DeliverySettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub retry_interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled
/// from [`Settings::default`].
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub store: Option<PartialStoreSettings>,
    pub delivery: Option<PartialDeliverySettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStoreSettings {
    pub data_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialDeliverySettings {
    pub workers: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub request_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub retry_interval_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreSettings {
                data_dir: "pubsub_data".to_string(),
            },
            delivery: DeliverySettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 3_000,
            retry_interval_secs: 300,
            shutdown_grace_secs: 10,
        }
    }
}
