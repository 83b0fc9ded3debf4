use super::error::{BrokerError, DeliveryError, StorageError};
use super::logging;

#[test]
fn logging_init_accepts_levels() {
    // Repeated initialization must not panic.
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn parse_level_falls_back_to_info() {
    assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
    assert_eq!(logging::parse_level(" trace "), tracing::Level::TRACE);
    assert_eq!(logging::parse_level("loud"), tracing::Level::INFO);
}

#[test]
fn not_found_messages_name_the_entity() {
    let err = BrokerError::topic_not_found("ORDERS");
    assert_eq!(err.to_string(), "topic 'ORDERS' not found");

    let err = BrokerError::message_not_found("abc");
    assert_eq!(err.to_string(), "message 'abc' not found");
}

#[test]
fn storage_errors_convert_into_broker_errors() {
    let err: BrokerError = StorageError::MissingRecord {
        container: "messages.new",
        id: "m1".into(),
    }
    .into();
    assert!(matches!(err, BrokerError::Storage(_)));
    assert_eq!(err.to_string(), "no record 'm1' in container 'messages.new'");
}

#[test]
fn status_error_reports_code() {
    assert_eq!(
        DeliveryError::Status(503).to_string(),
        "subscriber answered with status 503"
    );
}
