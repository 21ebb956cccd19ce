//! `AgentConfig`/`DataClientConfig` have no inline tests of their own
//! (`config.rs` is plain field construction); covered here instead.

use metricq::config::DataClientConfig;
use metricq::time::Timedelta;
use metricq::AgentConfig;

#[test]
fn durable_token_gets_a_bare_rpc_queue_name() {
    let config = AgentConfig::new("amqp://localhost/", "my-source").with_durable(true);
    assert_eq!(config.rpc_queue_name(), "my-source-rpc");
}

#[test]
fn transient_token_gets_a_uuid_suffixed_rpc_queue_name() {
    let config = AgentConfig::new("amqp://localhost/", "my-sink").with_add_uuid_to_token(true);
    let first = config.rpc_queue_name();
    let second = config.rpc_queue_name();
    assert!(first.starts_with("my-sink-rpc-"));
    assert_ne!(first, second, "each call mints a fresh uuid suffix");
}

#[test]
fn builder_methods_override_the_sixty_second_defaults() {
    let config = AgentConfig::new("amqp://localhost/", "token")
        .with_rpc_timeout(Timedelta::from_s(5.0))
        .with_connection_timeout(Timedelta::from_s(30.0));
    assert_eq!(config.rpc_timeout, Timedelta::from_s(5.0));
    assert_eq!(config.connection_timeout, Timedelta::from_s(30.0));
}

#[test]
fn data_client_config_falls_back_to_the_agents_connection_timeout() {
    let default_config = DataClientConfig::default();
    assert_eq!(
        default_config.connection_timeout(Timedelta::from_s(60.0)),
        Timedelta::from_s(60.0)
    );

    let overridden = DataClientConfig {
        connection_timeout: Some(Timedelta::from_s(12.0)),
        ..DataClientConfig::default()
    };
    assert_eq!(
        overridden.connection_timeout(Timedelta::from_s(60.0)),
        Timedelta::from_s(12.0)
    );
}
