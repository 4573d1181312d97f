//! HTTP-level tests against a local mock of the target API

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use surge_loadtest::config::{BackoffPolicy, Credentials, Jitter, SessionSettings, TargetSettings};
use surge_loadtest::endpoint::Method;
use surge_loadtest::scheduler::{ExecutorKind, StageDefinition};
use surge_loadtest::*;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport() -> ReqwestTransport {
    ReqwestTransport::new(&TargetSettings::default()).unwrap()
}

fn always_on(names: &[&str]) -> EndpointCatalog {
    let overrides: HashMap<String, f64> = names.iter().map(|n| (n.to_string(), 1.0)).collect();
    EndpointCatalog::standard()
        .with_activation_overrides(&overrides)
        .unwrap()
}

fn instant_backoff() -> BackoffPolicy {
    BackoffPolicy {
        auth: Jitter::new(0.0, 0.0),
        read: Jitter::new(0.0, 0.0),
        write: Jitter::new(0.0, 0.0),
    }
}

fn server_rate_limit_body() -> serde_json::Value {
    serde_json::json!({
        "success": false,
        "message": "Terlalu banyak permintaan. Silakan coba lagi nanti.",
        "data": { "retry_after_seconds": 42 }
    })
}

#[tokio::test]
async fn test_transport_sends_bearer_and_json() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/users/bank"))
        .and(header("authorization", "Bearer tok123"))
        .and(header("content-type", "application/json"))
        .and(body_json(serde_json::json!({"id": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success":true}"#))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = transport()
        .send(&HttpRequest {
            method: Method::Put,
            url: format!("{}/api/users/bank", server.uri()),
            bearer: Some("tok123".into()),
            body: Some(serde_json::json!({"id": 1})),
        })
        .await
        .unwrap();

    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, r#"{"success":true}"#);
}

#[tokio::test]
async fn test_transport_error_when_nothing_listens() {
    // Reserve a port, then free it so the connection is refused
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let url = format!("http://127.0.0.1:{}/api/products", port);

    let result = transport()
        .send(&HttpRequest {
            method: Method::Get,
            url,
            bearer: None,
            body: None,
        })
        .await;

    assert!(matches!(result, Err(LoadTestError::Transport { .. })));
}

#[tokio::test]
async fn test_truncated_body_keeps_status() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Announces 100 body bytes, sends 5, then hangs up
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = socket.read(&mut buf).await;
        let _ = socket
            .write_all(b"HTTP/1.1 429 Too Many Requests\r\nContent-Length: 100\r\n\r\nshort")
            .await;
        let _ = socket.shutdown().await;
    });

    let outcome = transport()
        .send(&HttpRequest {
            method: Method::Get,
            url: format!("http://{}/api/products", addr),
            bearer: None,
            body: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.status, 429);
    assert!(outcome.body.is_empty());
    assert!(is_rate_limited(outcome.status, &outcome.body));
}

#[tokio::test]
async fn test_rate_limit_signals_from_real_responses() {
    let server = MockServer::start().await;
    Mock::given(path("/api/header"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "17")
                .set_body_string("{}"),
        )
        .mount(&server)
        .await;
    Mock::given(path("/api/body"))
        .respond_with(ResponseTemplate::new(429).set_body_json(server_rate_limit_body()))
        .mount(&server)
        .await;
    Mock::given(path("/api/text"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Too many requests, slow down"))
        .mount(&server)
        .await;

    let t = transport();
    let get = |p: &str| HttpRequest {
        method: Method::Get,
        url: format!("{}/api/{}", server.uri(), p),
        bearer: None,
        body: None,
    };

    let by_header = t.send(&get("header")).await.unwrap();
    assert!(is_rate_limited(by_header.status, &by_header.body));
    assert_eq!(
        retry_after(&by_header.headers, &by_header.body),
        Some(Duration::from_secs(17))
    );

    let by_body = t.send(&get("body")).await.unwrap();
    assert_eq!(
        retry_after(&by_body.headers, &by_body.body),
        Some(Duration::from_secs(42))
    );

    let by_text = t.send(&get("text")).await.unwrap();
    assert_eq!(by_text.status, 503);
    assert!(is_rate_limited(by_text.status, &by_text.body));
}

#[tokio::test]
async fn test_bootstrap_over_http() {
    let server = MockServer::start().await;
    let credentials = Credentials::default();
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .and(body_json(credentials.login_body()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "data": { "access_token": "live-token" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let t = transport();
    let settings = SessionSettings::default();
    let base = format!("{}/api", server.uri());
    let bootstrap = SessionBootstrapper::new(&t, &base, &credentials, &settings)
        .bootstrap()
        .await;

    assert_eq!(bootstrap.session.token(), Some("live-token"));
    assert_eq!(bootstrap.attempts, 1);
}

#[tokio::test]
async fn test_probe_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users/transaction"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(429).set_body_json(server_rate_limit_body()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/users/transaction"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let sinks = Arc::new(MetricSinks::new());
    let probe = EndpointProbe::new(
        Arc::new(transport()),
        sinks.clone(),
        Arc::new(always_on(&["transactions"])),
        &format!("{}/api", server.uri()),
        Credentials::default(),
        instant_backoff(),
    );
    let session = Session::authenticated("tok");
    let ctx = ProbeContext {
        session: &session,
        stage: "load",
    };
    let mut rng = ChaCha8Rng::seed_from_u64(5);

    let mut limited = 0;
    for _ in 0..12 {
        let outcome = probe
            .probe(EndpointId::Transactions, &ctx, &mut rng)
            .await
            .unwrap();
        assert!(outcome.success);
        if outcome.rate_limited {
            limited += 1;
            assert_eq!(outcome.retry_after, Some(Duration::from_secs(42)));
        }
    }

    let snapshot = sinks.snapshot();
    assert_eq!(snapshot.read_requests, 12);
    assert_eq!(snapshot.rate_limit_hits, limited);
    assert_eq!(snapshot.read_rate_limited.hits, limited);
    assert_eq!(snapshot.errors.hits, 0);
}

#[tokio::test]
async fn test_short_run_writes_artifact() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "access_token": "run-token" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/register"))
        .respond_with(ResponseTemplate::new(429).set_body_json(server_rate_limit_body()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = LoadTestConfig::default();
    config.target.base_url = format!("{}/api", server.uri());
    config.backoff = instant_backoff();
    config.run.seed = Some(1);
    config.run.artifact_path = dir.path().join("analysis.json").display().to_string();
    config.activation.insert("register".into(), 1.0);
    config.activation.insert("login".into(), 1.0);
    config.scenarios = vec![StageDefinition {
        name: "smoke".into(),
        tag: "smoke".into(),
        start_offset_secs: 0,
        graceful_stop_secs: 0,
        executor: ExecutorKind::ConstantVus {
            vus: 1,
            duration_secs: 1,
        },
    }];
    let settings = config.run.clone();

    let outcome = LoadTestRunner::new(config).unwrap().run().await.unwrap();
    outcome.write_outputs(&settings).unwrap();

    assert!(outcome.authenticated);
    assert_eq!(outcome.snapshot.auth_requests, 2);
    assert_eq!(outcome.snapshot.rate_limit_hits, 1);
    assert_eq!(outcome.stages[0].interrupted, 1);

    let json: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("analysis.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(json["rate_limit_analysis"]["total_requests"], 2);
    assert_eq!(json["rate_limit_analysis"]["rate_limit_hits"], 1);
    assert_eq!(json["rate_limit_analysis"]["auth_requests"], 2);
}
