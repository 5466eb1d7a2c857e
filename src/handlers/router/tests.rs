use super::*;
use axum::body::Body;
use axum::routing::get;
use http::Request as HttpRequest;

fn rule_router(pairs: &[(&str, &str)]) -> RuleRouter {
    RuleRouter::new(
        pairs
            .iter()
            .map(|(p, s)| Rule::start(&RuleConfig::new(*p, *s)))
            .collect(),
    )
}

fn app(rules: &RuleRouter) -> Router {
    rules.clone().into_router(Router::new())
}

async fn get_uri(app: &Router, uri: &str) -> (StatusCode, String) {
    let req = HttpRequest::builder().uri(uri).body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, body) = get_uri(app, uri).await;
    (status, serde_json::from_str(&body).unwrap())
}

#[test]
fn test_path_matches() {
    assert!(path_matches("/publish", "/publish"));
    assert!(path_matches("/publish/extra", "/publish"));
    assert!(path_matches("/chat/anything", "/chat/"));
    assert!(!path_matches("/publishing", "/publish"));
    assert!(!path_matches("/pub", "/publish"));
}

#[tokio::test]
async fn test_route_first_match_wins() {
    let rules = rule_router(&[("/a/pub", "/a/sub"), ("/a", "/other")]);

    let (rule, endpoint) = rules.route("/a/pub").unwrap();
    assert_eq!(rule.publish_path(), "/a/pub");
    assert_eq!(endpoint, Endpoint::Publish);

    let (rule, endpoint) = rules.route("/a/sub").unwrap();
    assert_eq!(rule.subscribe_path(), "/a/sub");
    assert_eq!(endpoint, Endpoint::Subscribe);

    let (rule, _) = rules.route("/a/elsewhere").unwrap();
    assert_eq!(rule.publish_path(), "/a");

    assert!(rules.route("/nothing").is_none());
    rules.shutdown().await;
}

#[tokio::test]
async fn test_publish_via_query() {
    let rules = rule_router(&[("/publish", "/subscribe")]);
    let app = app(&rules);

    let (status, body) = get_uri(&app, "/publish?category=demo&body=foo").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
    assert_eq!(rules.rules()[0].broker().store().len("demo").await, 1);
    rules.shutdown().await;
}

#[tokio::test]
async fn test_publish_missing_fields() {
    let rules = rule_router(&[("/publish", "/subscribe")]);
    let app = app(&rules);

    let (status, body) = get_uri(&app, "/publish?body=foo").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Not OK");

    let (status, _) = get_uri(&app, "/publish?category=demo").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, _) = get_uri(&app, "/publish?category=&body=").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    assert_eq!(rules.rules()[0].broker().store().category_count().await, 0);
    rules.shutdown().await;
}

#[tokio::test]
async fn test_publish_via_form_post() {
    let rules = rule_router(&[("/publish", "/subscribe")]);
    let app = app(&rules);

    let req = HttpRequest::builder()
        .method(Method::POST)
        .uri("/publish")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("category=team&body=hello+world"))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );

    let events = rules.rules()[0]
        .broker()
        .store()
        .since("team", Cursor::START)
        .await;
    assert_eq!(events[0].body, "hello world");
    rules.shutdown().await;
}

#[tokio::test]
async fn test_unmatched_path_passes_through() {
    let rules = rule_router(&[("/publish", "/subscribe")]);
    let next = Router::new().route("/hello", get(|| async { "from next" }));
    let app = rules.clone().into_router(next);

    let (status, body) = get_uri(&app, "/hello").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "from next");

    let (status, _) = get_uri(&app, "/not_a_pubsub").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    rules.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_requires_category() {
    let rules = rule_router(&[("/publish", "/subscribe")]);
    let app = app(&rules);

    let (status, json) = get_json(&app, "/subscribe?timeout=1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "subscription category missing");
    rules.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_returns_retained_events_since_cursor() {
    let rules = rule_router(&[("/publish", "/subscribe")]);
    let app = app(&rules);

    get_uri(&app, "/publish?category=team&body=one").await;
    get_uri(&app, "/publish?category=team&body=two").await;

    let (status, json) = get_json(&app, "/subscribe?category=team&timeout=1&since=0").await;
    assert_eq!(status, StatusCode::OK);
    let events = json["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["body"], "one");
    assert_eq!(events[1]["body"], "two");
    assert_eq!(events[1]["category"], "team");
    assert!(events[1]["timestamp"].is_i64());
    assert_eq!(json["cursor"], events[1]["id"]);
    assert!(json.get("timeout").is_none());

    let cursor = json["cursor"].as_u64().unwrap();
    let uri = format!("/subscribe?category=team&timeout=1&since={}", cursor - 1);
    let (_, json) = get_json(&app, &uri).await;
    assert_eq!(json["events"].as_array().unwrap().len(), 1);
    rules.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_times_out_with_empty_result() {
    let rules = rule_router(&[("/publish", "/subscribe")]);
    let app = app(&rules);

    let started = tokio::time::Instant::now();
    let (status, json) = get_json(&app, "/subscribe?category=none&timeout=1").await;

    assert_eq!(status, StatusCode::OK);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(json["events"].as_array().unwrap().is_empty());
    assert_eq!(json["timeout"], "no events before timeout");
    assert!(json["timestamp"].is_i64());
    rules.shutdown().await;
}

#[tokio::test]
async fn test_blocked_subscribe_receives_publish() {
    let rules = rule_router(&[("/p", "/s")]);
    let app = app(&rules);

    let pending = {
        let app = app.clone();
        tokio::spawn(async move { get_json(&app, "/s?category=team&timeout=5").await })
    };
    let broker = Arc::clone(rules.rules()[0].broker());
    while broker.waiters().pending("team").await == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (status, body) = get_uri(&app, "/p?category=team&body=hello").await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));

    let (status, json) = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("subscriber should wake before its timeout")
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["events"][0]["body"], "hello");
    rules.shutdown().await;
}

#[tokio::test]
async fn test_rules_are_isolated() {
    let rules = rule_router(&[("/a/p", "/a/s"), ("/b/p", "/b/s")]);
    let app = app(&rules);

    let waiting_on_b = {
        let app = app.clone();
        tokio::spawn(async move { get_json(&app, "/b/s?category=team&timeout=1").await })
    };
    let broker_b = Arc::clone(rules.rules()[1].broker());
    while broker_b.waiters().pending("team").await == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    get_uri(&app, "/a/p?category=team&body=for-a").await;

    let (status, json) = waiting_on_b.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(json["events"].as_array().unwrap().is_empty());
    assert_eq!(json["timeout"], "no events before timeout");
    assert_eq!(rules.rules()[1].broker().store().len("team").await, 0);
    rules.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_subscribers_with_503() {
    let rules = rule_router(&[("/p", "/s")]);
    let app = app(&rules);

    let pending = {
        let app = app.clone();
        tokio::spawn(async move { get_json(&app, "/s?category=team&timeout=30").await })
    };
    let broker = Arc::clone(rules.rules()[0].broker());
    while broker.waiters().pending("team").await == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    rules.shutdown().await;
    let (status, json) = pending.await.unwrap();
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"], "broker shutting down");
}

#[test]
fn test_subscribe_params_parsing() {
    let params = SubscribeParams {
        category: Some("team".into()),
        timeout: Some("abc".into()),
        since: None,
        since_time: Some("1700000000000".into()),
    };
    assert_eq!(params.timeout(), None);
    assert_eq!(params.cursor(), Some(Cursor::Time(1_700_000_000_000)));

    let params = SubscribeParams {
        timeout: Some("5".into()),
        since: Some("12".into()),
        since_time: Some("1700000000000".into()),
        ..Default::default()
    };
    assert_eq!(params.timeout(), Some(Duration::from_secs(5)));
    assert_eq!(params.cursor(), Some(Cursor::Id(12)));

    let params = SubscribeParams {
        timeout: Some("0".into()),
        ..Default::default()
    };
    assert_eq!(params.timeout(), None);
    assert_eq!(params.cursor(), None);
}

#[tokio::test]
async fn test_publish_repeated_keys_use_first_value() {
    let rules = rule_router(&[("/p", "/s")]);
    let app = app(&rules);

    let (status, body) = get_uri(&app, "/p?category=a&category=b&body=x&body=y").await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));

    let store = rules.rules()[0].broker().store();
    let events = store.since("a", Cursor::START).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].body, "x");
    assert_eq!(store.len("b").await, 0);
    rules.shutdown().await;
}

#[tokio::test]
async fn test_publish_form_fields_precede_query() {
    let rules = rule_router(&[("/p", "/s")]);
    let app = app(&rules);

    let req = HttpRequest::builder()
        .method(Method::POST)
        .uri("/p?category=from-query&body=query-body")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("category=from-form&category=later"))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let events = rules.rules()[0]
        .broker()
        .store()
        .since("from-form", Cursor::START)
        .await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].body, "query-body");
    rules.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_repeated_keys_use_first_value() {
    let rules = rule_router(&[("/p", "/s")]);
    let app = app(&rules);

    get_uri(&app, "/p?category=a&body=for-a").await;
    get_uri(&app, "/p?category=b&body=for-b").await;

    let (status, json) = get_json(
        &app,
        "/s?category=a&category=b&timeout=1&since=0&since=99",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = json["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["body"], "for-a");
    rules.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_timeout_without_cursor_reports_latest_id() {
    let rules = rule_router(&[("/p", "/s")]);
    let app = app(&rules);

    get_uri(&app, "/p?category=other&body=earlier").await;
    let latest = rules.rules()[0].broker().store().high_water();

    let (status, json) = get_json(&app, "/s?category=team&timeout=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["timeout"], "no events before timeout");
    assert_eq!(json["cursor"], latest);
    assert!(json.get("since_time").is_none());
    rules.shutdown().await;
}
