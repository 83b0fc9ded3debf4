mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{DeliverySettings, LogSettings, Settings, StoreSettings};

/// Prefix for environment overrides, e.g. `DURAPUB_DELIVERY__WORKERS=8`.
pub const ENV_PREFIX: &str = "DURAPUB";

/// Loads the configuration from `config/default` and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Loads the configuration from the given file (extension optional, file
/// optional) layered under environment variables, then merges with defaults.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let name = path.as_ref().to_string_lossy().into_owned();
    let builder = Config::builder()
        .add_source(File::with_name(&name).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let store = partial.store;
    let delivery = partial.delivery;
    let log = partial.log;

    Settings {
        store: StoreSettings {
            data_dir: store
                .and_then(|s| s.data_dir)
                .unwrap_or(default.store.data_dir),
        },
        delivery: DeliverySettings {
            workers: delivery
                .as_ref()
                .and_then(|d| d.workers)
                .unwrap_or(default.delivery.workers),
            queue_capacity: delivery
                .as_ref()
                .and_then(|d| d.queue_capacity)
                .unwrap_or(default.delivery.queue_capacity),
            request_timeout_ms: delivery
                .as_ref()
                .and_then(|d| d.request_timeout_ms)
                .unwrap_or(default.delivery.request_timeout_ms),
            connect_timeout_ms: delivery
                .as_ref()
                .and_then(|d| d.connect_timeout_ms)
                .unwrap_or(default.delivery.connect_timeout_ms),
            retry_interval_secs: delivery
                .as_ref()
                .and_then(|d| d.retry_interval_secs)
                .unwrap_or(default.delivery.retry_interval_secs),
            shutdown_grace_secs: delivery
                .as_ref()
                .and_then(|d| d.shutdown_grace_secs)
                .unwrap_or(default.delivery.shutdown_grace_secs),
        },
        log: LogSettings {
            level: log.and_then(|l| l.level).unwrap_or(default.log.level),
        },
    }
}
