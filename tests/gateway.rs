//! End-to-end scenarios through the router, against mocked upstreams.

mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{Harness, RAW_KEY, body_json, key, post_json};
use tollgate::config::Config;
use tollgate::estimator::Estimator;
use tollgate::limits::TimeUnit;
use tollgate::store::types::{PolicyAction, RegexRule};
use tollgate::store::{
    ApiKey, CustomProvider, CustomProvidersManager, KeyManager, KeyQuery, PoliciesManager, Policy,
    Route, RouteConfig, RouteManager, Step,
};

fn config_with(f: impl FnOnce(&mut Config)) -> Config {
    let mut config = Config::default();
    f(&mut config);
    config
}

#[tokio::test]
async fn openai_chat_completion_is_priced_and_recorded() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-upstream"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-3.5-turbo",
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut h = Harness::new(config_with(|c| c.upstreams.openai = upstream.uri()));
    h.setting("s1", "openai", &[("apikey", "sk-upstream")]);
    h.store.create_key(&key("s1")).unwrap();
    h.sync();

    let resp = h
        .send(post_json(
            "/api/providers/openai/v1/chat/completions",
            json!({"model": "gpt-3.5-turbo", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));

    let event = h.next_event().await;
    assert_eq!(event.status_code, 200);
    assert_eq!(event.key_id, "key-1");
    assert_eq!(event.provider, "openai");
    assert_eq!(event.model, "gpt-3.5-turbo");
    assert_eq!(event.prompt_token_count, 10);
    assert_eq!(event.completion_token_count, 5);
    assert!((event.cost_in_usd - 0.000025).abs() < 1e-12);
    assert!(event.latency_in_ms > 0);
}

#[tokio::test]
async fn third_request_in_a_minute_is_rate_limited() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        })))
        .expect(2)
        .mount(&upstream)
        .await;

    let mut h = Harness::new(config_with(|c| c.upstreams.openai = upstream.uri()));
    h.setting("s1", "openai", &[("apikey", "sk")]);
    h.store
        .create_key(&ApiKey {
            rate_limit_over_time: 2,
            rate_limit_unit: "m".into(),
            ..key("s1")
        })
        .unwrap();
    h.sync();

    let body = json!({"model": "gpt-3.5-turbo", "messages": [{"role": "user", "content": "hi"}]});
    let mut statuses = Vec::new();
    for _ in 0..3 {
        let resp = h
            .send(post_json("/api/providers/openai/v1/chat/completions", body.clone()))
            .await;
        statuses.push(resp.status());
    }
    assert_eq!(
        statuses,
        [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );
    assert_eq!(h.state.limits.get("key-1", TimeUnit::Minute).await.unwrap(), 2);

    let codes: Vec<u16> = [
        h.next_event().await,
        h.next_event().await,
        h.next_event().await,
    ]
    .iter()
    .map(|e| e.status_code)
    .collect();
    assert_eq!(codes, [200, 200, 429]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_exceed_the_rate_limit() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        })))
        .mount(&upstream)
        .await;

    let h = Harness::new(config_with(|c| c.upstreams.openai = upstream.uri()));
    h.setting("s1", "openai", &[("apikey", "sk")]);
    h.store
        .create_key(&ApiKey {
            rate_limit_over_time: 5,
            rate_limit_unit: "h".into(),
            ..key("s1")
        })
        .unwrap();
    h.sync();

    let app = h.app();
    let mut handles = Vec::new();
    for _ in 0..64 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let req = post_json(
                "/api/providers/openai/v1/chat/completions",
                json!({"model": "gpt-3.5-turbo", "messages": [{"role": "user", "content": "hi"}]}),
            );
            tower::ServiceExt::oneshot(app, req).await.unwrap().status()
        }));
    }
    let mut admitted = 0;
    let mut limited = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StatusCode::OK => admitted += 1,
            StatusCode::TOO_MANY_REQUESTS => limited += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!((admitted, limited), (5, 59));
    assert_eq!(h.state.limits.get("key-1", TimeUnit::Hour).await.unwrap(), 5);
}

#[tokio::test]
async fn request_timeout_header_bounds_the_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(std::time::Duration::from_secs(3))
                .set_body_json(json!({"usage": {"prompt_tokens": 1, "completion_tokens": 1}})),
        )
        .mount(&upstream)
        .await;

    let mut h = Harness::new(config_with(|c| c.upstreams.openai = upstream.uri()));
    h.setting("s1", "openai", &[("apikey", "sk")]);
    h.store.create_key(&key("s1")).unwrap();
    h.sync();

    let mut req = post_json(
        "/api/providers/openai/v1/chat/completions",
        json!({"model": "gpt-3.5-turbo", "messages": [{"role": "user", "content": "hi"}]}),
    );
    req.headers_mut()
        .insert("x-request-timeout", "100ms".parse().unwrap());
    let started = std::time::Instant::now();
    let resp = h.send(req).await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
    assert_eq!(h.next_event().await.status_code, 504);
}

#[tokio::test]
async fn expired_key_is_denied_and_revoked() {
    let mut h = Harness::new(Config::default());
    h.setting("s1", "openai", &[("apikey", "sk")]);
    h.store
        .create_key(&ApiKey {
            created_at: chrono::Utc::now().timestamp() - 3600,
            ttl: "1h".into(),
            ..key("s1")
        })
        .unwrap();
    h.sync();

    let resp = h
        .send(post_json(
            "/api/providers/openai/v1/chat/completions",
            json!({"model": "gpt-3.5-turbo", "messages": []}),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["detail"], "key has expired");

    let stored = h.store.get_keys(&KeyQuery::default()).unwrap();
    assert!(stored[0].revoked);
    assert_eq!(h.next_event().await.status_code, 401);
}

#[tokio::test]
async fn anthropic_stream_is_relayed_and_counted() {
    let sse = "event: completion\ndata: {\"completion\":\" hi\"}\n\n\
               event: completion\ndata: {\"completion\":\" there\"}\n\n";
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/complete"))
        .and(header("x-api-key", "ant-key"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(&upstream)
        .await;

    let mut h = Harness::new(config_with(|c| c.upstreams.anthropic = upstream.uri()));
    h.setting("s1", "anthropic", &[("apikey", "ant-key")]);
    h.store.create_key(&key("s1")).unwrap();
    h.sync();

    let req = Request::builder()
        .method("POST")
        .uri("/api/providers/anthropic/v1/complete")
        .header("x-api-key", RAW_KEY)
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"model": "claude-2", "stream": true, "prompt": "Human: hello\n\nAssistant:"})
                .to_string(),
        ))
        .unwrap();
    let resp = h.send(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), sse.as_bytes());

    let event = h.next_event().await;
    assert_eq!(event.status_code, 200);
    assert_eq!(
        event.completion_token_count,
        Estimator::new().count_anthropic_tokens(" hi there") + 4
    );
}

#[tokio::test]
async fn custom_provider_route_config_is_followed() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ask"))
        .and(header("x-acme-key", "acme-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"answer": "world"})))
        .mount(&upstream)
        .await;

    let mut h = Harness::new(Config::default());
    h.setting("s1", "acme", &[("apikey", "acme-secret")]);
    h.store
        .create_custom_provider(&CustomProvider {
            provider: "acme".into(),
            authentication_param: "x-acme-key".into(),
            route_configs: vec![RouteConfig {
                path: "/v1/ask".into(),
                target_url: format!("{}/ask", upstream.uri()),
                model_location: "model".into(),
                request_prompt_location: "q".into(),
                stream_location: "stream".into(),
                response_completion_location: "answer".into(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .unwrap();
    h.store.create_key(&key("s1")).unwrap();
    h.sync();

    let resp = h
        .send(post_json(
            "/api/custom/providers/acme/v1/ask",
            json!({"q": "hello", "model": "m1", "stream": false}),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["answer"], "world");

    let event = h.next_event().await;
    assert_eq!(event.provider, "acme");
    assert_eq!(event.model, "m1");
    assert_eq!(
        event.completion_token_count,
        Estimator::new().count_anthropic_tokens("world")
    );
}

#[tokio::test]
async fn route_falls_back_to_the_next_step() {
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "down"})))
        .expect(1)
        .mount(&openai)
        .await;
    let anthropic = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "hello"}],
            "usage": {"input_tokens": 8, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&anthropic)
        .await;

    let mut h = Harness::new(config_with(|c| {
        c.upstreams.openai = openai.uri();
        c.upstreams.anthropic = anthropic.uri();
    }));
    h.setting("s-openai", "openai", &[("apikey", "sk")]);
    h.setting("s-anthropic", "anthropic", &[("apikey", "ak")]);
    h.store
        .create_key(&ApiKey {
            setting_ids: vec!["s-anthropic".into()],
            ..key("s-openai")
        })
        .unwrap();
    h.store
        .create_route(&Route {
            name: "chat".into(),
            path: "/chat".into(),
            steps: vec![
                Step {
                    provider: "openai".into(),
                    model: "gpt-4".into(),
                    params: Default::default(),
                },
                Step {
                    provider: "anthropic".into(),
                    model: "claude-instant".into(),
                    params: Default::default(),
                },
            ],
            key_ids: vec!["key-1".into()],
            ..Default::default()
        })
        .unwrap();
    h.sync();

    let resp = h
        .send(post_json(
            "/api/routes/chat",
            json!({"messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let event = h.next_event().await;
    assert_eq!(event.provider, "anthropic");
    assert_eq!(event.model, "claude-instant");
    assert_eq!(event.status_code, 200);
}

#[tokio::test]
async fn blocking_policy_denies_before_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let mut h = Harness::new(config_with(|c| c.upstreams.openai = upstream.uri()));
    h.setting("s1", "openai", &[("apikey", "sk")]);
    let policy = h
        .store
        .create_policy(&Policy {
            name: "no-secrets".into(),
            regex_config: vec![RegexRule {
                definition: r"secret-\d+".into(),
                action: PolicyAction::Block,
            }],
            ..Default::default()
        })
        .unwrap();
    h.store
        .create_key(&ApiKey {
            policy_ids: vec![policy.id],
            ..key("s1")
        })
        .unwrap();
    h.sync();

    let resp = h
        .send(post_json(
            "/api/providers/openai/v1/chat/completions",
            json!({"model": "gpt-4", "messages": [{"role": "user", "content": "my secret-42"}]}),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.next_event().await.status_code, 403);
}

#[tokio::test]
async fn unknown_key_is_unauthorized() {
    let mut h = Harness::new(Config::default());
    h.sync();
    let resp = h
        .send(post_json("/api/providers/openai/v1/chat/completions", json!({})))
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let event = h.next_event().await;
    assert_eq!(event.status_code, 401);
    assert!(event.key_id.is_empty());
}

#[tokio::test]
async fn health_bypasses_governance() {
    let h = Harness::new(Config::default());
    h.setting("s1", "openai", &[("apikey", "sk")]);
    h.sync();
    let resp = h
        .send(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["mirror"]["settings"], 1);
}
