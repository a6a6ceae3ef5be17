//! Unit tests for tunnel decoding and request planning.

use std::time::Duration;

use mockall::predicate::function;
use rstest::{fixture, rstest};
use serde_json::{Map, Value, json};
use warden_installer::DaemonVersion;

use super::*;
use crate::control_plane::HttpMethod;
use crate::tests::support::MockApi;

const API_URL: &str = "http://127.0.0.1:4040";

#[fixture]
fn tunnel() -> Tunnel {
    Tunnel::from_response(
        json!({
            "ID": "tn_1",
            "name": "my web",
            "uri": "/api/tunnels/my+web",
            "public_url": "https://t1.ngrok.example",
            "proto": "https",
            "config": {"addr": "http://localhost:8080", "inspect": true},
            "metrics": {}
        }),
        API_URL,
    )
    .expect("tunnel decodes")
}

fn definitions(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[rstest]
fn decodes_control_plane_shape(tunnel: Tunnel) {
    assert_eq!(tunnel.id(), Some("tn_1"));
    assert_eq!(tunnel.name(), "my web");
    assert_eq!(tunnel.proto(), "https");
    assert_eq!(tunnel.forward_addr(), Some("http://localhost:8080"));
    assert_eq!(tunnel.api_url(), API_URL);
}

#[test]
fn accepts_lowercase_id_and_missing_id() {
    let lower = Tunnel::from_response(
        json!({"id": "tn_2", "name": "a", "public_url": "tcp://0.tcp.ngrok.example:1"}),
        API_URL,
    )
    .expect("decodes");
    let absent =
        Tunnel::from_response(json!({"name": "b", "public_url": "https://x"}), API_URL)
            .expect("decodes");

    assert_eq!(lower.id(), Some("tn_2"));
    assert_eq!(absent.id(), None);
}

#[test]
fn accepts_both_id_spellings_at_once() {
    let both = Tunnel::from_response(
        json!({"ID": "tn_legacy", "id": "tn_3", "name": "a", "public_url": "https://x"}),
        API_URL,
    )
    .expect("decodes");

    assert_eq!(both.id(), Some("tn_3"));
}

#[rstest]
#[case(json!({"name": "web", "public_url": ""}))]
#[case(json!({"name": "web"}))]
#[case(json!(["not", "a", "tunnel"]))]
fn rejects_tunnels_without_public_url(#[case] value: Value) {
    let error = Tunnel::from_response(value, API_URL).expect_err("must fail");
    assert!(matches!(error, AgentError::General { .. }), "got {error}");
}

#[rstest]
fn resource_url_encodes_spaces(tunnel: Tunnel) {
    assert_eq!(tunnel.resource_url(), "http://127.0.0.1:4040/api/tunnels/my%20web");
    assert_eq!(
        tunnel.resource_url_at("http://127.0.0.1:4041"),
        "http://127.0.0.1:4041/api/tunnels/my%20web"
    );
}

#[rstest]
fn refresh_metrics_replaces_metrics(mut tunnel: Tunnel) {
    let mut api = MockApi::new();
    api.expect_request()
        .with(function(|request: &ApiRequest| {
            request.method() == HttpMethod::Get
                && request.url() == "http://127.0.0.1:4040/api/tunnels/my%20web"
                && request.timeout() == Duration::from_secs(2)
        }))
        .times(1)
        .returning(|_| Ok(json!({"metrics": {"conns": {"count": 3}}})));

    tunnel
        .refresh_metrics(&api, Duration::from_secs(2))
        .expect("refresh");

    assert_eq!(tunnel.metrics().get("conns"), Some(&json!({"count": 3})));
}

#[rstest]
fn refresh_metrics_requires_metrics(mut tunnel: Tunnel) {
    let mut api = MockApi::new();
    api.expect_request()
        .times(1)
        .returning(|_| Ok(json!({"name": "my web"})));

    let error = tunnel
        .refresh_metrics(&api, Duration::from_secs(2))
        .expect_err("must fail");

    assert!(matches!(error, AgentError::General { .. }), "got {error}");
}

#[test]
fn plan_fills_defaults_and_synthesises_name() {
    let plan = plan_tunnel(&TunnelRequest::new(), None, DaemonVersion::V3).expect("plan");

    assert_eq!(plan.addr, DEFAULT_ADDR);
    assert_eq!(plan.proto, DEFAULT_PROTO);
    assert!(plan.name.starts_with("http-80-"), "{}", plan.name);
    assert_eq!(plan.body.get("name"), Some(&json!(plan.name)));
    assert_eq!(plan.body.get("addr"), Some(&json!("80")));
    assert!(!plan.fetch_plaintext_variant);
}

#[test]
fn synthesised_names_are_unique() {
    let request = TunnelRequest::new().with_addr("5000");
    let first = plan_tunnel(&request, None, DaemonVersion::V3).expect("plan");
    let second = plan_tunnel(&request, None, DaemonVersion::V3).expect("plan");
    assert_ne!(first.name, second.name);
}

#[test]
fn file_addresses_get_file_names() {
    let request = TunnelRequest::new().with_addr("file:///srv/www");
    let plan = plan_tunnel(&request, None, DaemonVersion::V3).expect("plan");
    assert!(plan.name.starts_with("http-file-"), "{}", plan.name);
}

#[test]
fn caller_options_override_named_definition() {
    let tunnels = definitions(json!({
        "d": {"addr": "8000", "proto": "http", "subdomain": "x"}
    }));
    let request = TunnelRequest::new()
        .with_name("d")
        .with_option("subdomain", "y");

    let plan = plan_tunnel(&request, Some(&tunnels), DaemonVersion::V3).expect("plan");

    assert_eq!(plan.name, "d");
    assert_eq!(plan.body.get("subdomain"), Some(&json!("y")));
    assert_eq!(plan.body.get("addr"), Some(&json!("8000")));
    assert_eq!(plan.body.get("proto"), Some(&json!("http")));
}

#[test]
fn explicit_addr_and_proto_win_over_definition() {
    let tunnels = definitions(json!({"d": {"addr": 8000, "proto": "http"}}));
    let request = TunnelRequest::new()
        .with_name("d")
        .with_addr("22")
        .with_proto("tcp");

    let plan = plan_tunnel(&request, Some(&tunnels), DaemonVersion::V3).expect("plan");

    assert_eq!(plan.addr, "22");
    assert_eq!(plan.proto, "tcp");
}

#[test]
fn numeric_definition_addresses_become_strings() {
    let tunnels = definitions(json!({"d": {"addr": 8000}}));
    let plan = plan_tunnel(
        &TunnelRequest::new().with_name("d"),
        Some(&tunnels),
        DaemonVersion::V3,
    )
    .expect("plan");
    assert_eq!(plan.body.get("addr"), Some(&json!("8000")));
}

#[test]
fn unnamed_request_uses_default_definition() {
    let tunnels = definitions(json!({"default": {"addr": "3000", "inspect": false}}));

    let plan = plan_tunnel(&TunnelRequest::new(), Some(&tunnels), DaemonVersion::V3).expect("plan");

    assert_eq!(plan.name, DEFAULT_TUNNEL_DEFINITION);
    assert_eq!(plan.addr, "3000");
    assert_eq!(plan.body.get("inspect"), Some(&json!(false)));
}

#[test]
fn unknown_name_keeps_caller_name_without_definition() {
    let tunnels = definitions(json!({"default": {"addr": "3000"}}));

    let plan = plan_tunnel(
        &TunnelRequest::new().with_name("other"),
        Some(&tunnels),
        DaemonVersion::V3,
    )
    .expect("plan");

    assert_eq!(plan.name, "other");
    assert_eq!(plan.addr, DEFAULT_ADDR);
}

#[test]
fn malformed_definition_is_a_configuration_error() {
    let tunnels = definitions(json!({"d": "8000"}));
    let error = plan_tunnel(
        &TunnelRequest::new().with_name("d"),
        Some(&tunnels),
        DaemonVersion::V3,
    )
    .expect_err("must fail");
    assert!(matches!(error, AgentError::Configuration { .. }), "got {error}");
}

#[rstest]
#[case(json!(true), BindTls::Https)]
#[case(json!("true"), BindTls::Https)]
#[case(json!(false), BindTls::Http)]
#[case(json!("false"), BindTls::Http)]
#[case(json!(""), BindTls::Http)]
#[case(Value::Null, BindTls::Http)]
#[case(json!("both"), BindTls::Both)]
#[case(json!(1), BindTls::Https)]
#[case(json!(0), BindTls::Http)]
#[case(json!(0.0), BindTls::Http)]
#[case(json!(2), BindTls::Both)]
#[case(json!([]), BindTls::Both)]
fn classifies_bind_tls(#[case] value: Value, #[case] expected: BindTls) {
    assert_eq!(BindTls::from_value(&value), expected);
}

#[rstest]
#[case(json!(true), json!(["https"]))]
#[case(json!(false), json!(["http"]))]
#[case(json!("both"), json!(["http", "https"]))]
fn upgrade_translates_bind_tls(#[case] bind_tls: Value, #[case] schemes: Value) {
    let mut options = definitions(json!({"bind_tls": bind_tls, "subdomain": "x"}));

    upgrade_legacy_options(&mut options);

    assert_eq!(options.get("schemes"), Some(&schemes));
    assert!(!options.contains_key("bind_tls"));
    assert_eq!(options.get("subdomain"), Some(&json!("x")));
}

#[rstest]
#[case(json!("user:pass"), json!(["user:pass"]))]
#[case(json!(["a:b", "c:d"]), json!(["a:b", "c:d"]))]
fn upgrade_lists_basic_auth(#[case] auth: Value, #[case] expected: Value) {
    let mut options = definitions(json!({"auth": auth}));

    upgrade_legacy_options(&mut options);

    assert_eq!(options.get("basic_auth"), Some(&expected));
    assert!(!options.contains_key("auth"));
}

#[rstest]
#[case(Value::Null)]
#[case(json!(7))]
#[case(json!({"user": "pass"}))]
fn upgrade_leaves_other_auth_values_alone(#[case] auth: Value) {
    let mut options = definitions(json!({"auth": auth.clone()}));

    upgrade_legacy_options(&mut options);

    assert_eq!(options.get("auth"), Some(&auth));
    assert!(!options.contains_key("basic_auth"));
}

#[test]
fn legacy_agents_keep_legacy_options_and_fetch_plaintext_twin() {
    let request = TunnelRequest::new().with_option("auth", "user:pass");

    let plan = plan_tunnel(&request, None, DaemonVersion::V2).expect("plan");

    assert!(plan.fetch_plaintext_variant);
    assert_eq!(plan.body.get("auth"), Some(&json!("user:pass")));
    assert!(!plan.body.contains_key("basic_auth"));
}

#[rstest]
#[case(TunnelRequest::new().with_proto("tcp"))]
#[case(TunnelRequest::new().with_option("bind_tls", true))]
fn legacy_agents_skip_twin_fetch_when_not_dual(#[case] request: TunnelRequest) {
    let plan = plan_tunnel(&request, None, DaemonVersion::V2).expect("plan");
    assert!(!plan.fetch_plaintext_variant);
}
