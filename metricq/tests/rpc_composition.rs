//! Composes `client::base_handlers()` with a role-specific registry the way
//! `Source::new` layers `config`'s no-op handler on top of `DataClient`'s own
//! registry, then dispatches against the result — exercising the real
//! `discover` handler rather than a synthetic stand-in.

use metricq::client::base_handlers;
use metricq::rpc::{handler, HandlerRegistry, RpcArgs};

fn noop_config() -> metricq::rpc::RpcHandler {
    handler(|_args: RpcArgs| async { Ok(None) })
}

#[tokio::test]
async fn discover_reports_alive_with_a_nonnegative_uptime() {
    let registry = base_handlers();
    let reply = registry
        .dispatch("discover", RpcArgs::default())
        .await
        .unwrap()
        .expect("discover always replies");

    assert_eq!(reply["alive"], true);
    assert!(reply["uptime"].as_i64().unwrap() >= 0);
    assert!(reply["time"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn a_derived_registry_keeps_the_base_discover_handler() {
    let mut derived = HandlerRegistry::new();
    derived.merge(base_handlers());
    derived.register("config", noop_config());

    assert!(derived.is_registered("discover"));
    assert!(derived.is_registered("config"));

    let discover_reply = derived.dispatch("discover", RpcArgs::default()).await.unwrap();
    assert!(discover_reply.is_some());

    let config_reply = derived.dispatch("config", RpcArgs::default()).await.unwrap();
    assert_eq!(config_reply, None);
}

#[tokio::test]
async fn a_derived_registry_can_still_extend_a_shared_tag() {
    // Mirrors two roles both contributing a `config` handler to the same
    // tag (the base doing nothing, the derived role reacting): all handlers
    // run, and only the one that actually returns something decides the
    // reply, matching `HandlerRegistry::dispatch`'s "at most one non-empty
    // return" contract.
    let mut base = HandlerRegistry::new();
    base.register("config", noop_config());

    let mut derived = HandlerRegistry::new();
    derived.merge(base);
    derived.register(
        "config",
        handler(|_args: RpcArgs| async { Ok(Some(serde_json::json!({"applied": true}))) }),
    );

    let reply = derived.dispatch("config", RpcArgs::default()).await.unwrap();
    assert_eq!(reply, Some(serde_json::json!({"applied": true})));
}
