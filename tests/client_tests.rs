//! End-to-end tests for the client against a mock HTTP server.

use bytes::Bytes;
use sportsdata_client::{
    BatchProgress, CircuitBreakerConfig, CircuitState, DataCategory, FetchError, FetchRequest,
    ResilienceConfig, RetryConfig, SportsDataClient,
};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const API_KEY: &str = "integration-key-0042";

fn client(server: &MockServer, resilience: ResilienceConfig) -> SportsDataClient {
    SportsDataClient::builder()
        .api_key(API_KEY)
        .base_url(server.uri())
        .resilience(resilience)
        .build()
        .unwrap()
}

fn fast_retries(max_attempts: u32) -> ResilienceConfig {
    ResilienceConfig {
        retry: RetryConfig::new()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(10))
            .jitter(false),
        ..Default::default()
    }
}

fn box_score(id: u32) -> FetchRequest {
    FetchRequest::builder("box_score")
        .endpoint("/nfl/stats/json/BoxScore")
        .param("scoreid", id)
        .category(DataCategory::Live)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_fetch_sends_key_and_caches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nfl/stats/json/BoxScore"))
        .and(query_param("scoreid", "7"))
        .and(header("Ocp-Apim-Subscription-Key", API_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ScoreID":7}"#))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, fast_retries(3));

    let first = client.fetch(&box_score(7)).await.unwrap();
    let second = client.fetch(&box_score(7)).await.unwrap();

    assert_eq!(first, Bytes::from_static(br#"{"ScoreID":7}"#));
    assert_eq!(first, second);
    assert_eq!(client.status().cache.hits, 1);
}

#[tokio::test]
async fn test_same_operation_on_different_endpoints_is_cached_separately() {
    let server = MockServer::start().await;
    for (league, body) in [("nfl", "NFL"), ("nba", "NBA")] {
        Mock::given(method("GET"))
            .and(path(format!("/{league}/scores/json/Teams")))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;
    }

    let client = client(&server, fast_retries(1));
    let teams = |league: &str| {
        FetchRequest::builder("teams")
            .endpoint(format!("/{league}/scores/json/Teams"))
            .category(DataCategory::Team)
            .build()
            .unwrap()
    };

    assert_eq!(client.fetch(&teams("nfl")).await.unwrap(), Bytes::from_static(b"NFL"));
    assert_eq!(client.fetch(&teams("nba")).await.unwrap(), Bytes::from_static(b"NBA"));
    assert_eq!(client.fetch(&teams("nfl")).await.unwrap(), Bytes::from_static(b"NFL"));
    assert_eq!(client.status().cache.misses, 2);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, fast_retries(3));
    let body = client.fetch(&box_score(1)).await.unwrap();

    assert_eq!(body, Bytes::from_static(b"[]"));
    assert_eq!(client.metrics().retries, 1);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such game"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, fast_retries(5));
    let err = client.fetch(&box_score(404)).await.unwrap_err();

    match err {
        FetchError::PermanentUpstream {
            status_code,
            message,
        } => {
            assert_eq!(status_code, Some(404));
            assert!(message.contains("no such game"));
        }
        other => panic!("expected permanent failure, got {other:?}"),
    }
    assert_eq!(client.metrics().errors.get("permanent_upstream"), Some(&1));
}

#[tokio::test]
async fn test_retry_after_header_is_honored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let client = client(&server, fast_retries(2));
    let started = Instant::now();
    client.fetch(&box_score(2)).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("shared")
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, fast_retries(1));
    let request = box_score(3);
    let results = futures::future::join_all((0..8).map(|_| client.fetch(&request))).await;

    for result in results {
        assert_eq!(result.unwrap(), Bytes::from_static(b"shared"));
    }
    assert_eq!(client.status().cache.coalesced, 7);
}

#[tokio::test]
async fn test_circuit_opens_after_repeated_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let client = client(
        &server,
        ResilienceConfig {
            retry: RetryConfig::no_retries(),
            circuit_breaker: CircuitBreakerConfig::new()
                .failure_threshold(2)
                .break_duration(Duration::from_secs(60)),
            ..Default::default()
        },
    );

    for id in 0..2 {
        assert!(client.fetch(&box_score(id)).await.is_err());
    }
    let err = client.fetch(&box_score(99)).await.unwrap_err();

    assert!(matches!(err, FetchError::CircuitOpen { .. }));
    assert_eq!(client.status().circuit.state, CircuitState::Open);
    assert_eq!(client.metrics().circuit_transitions.get("closed->open"), Some(&1));
}

#[tokio::test]
async fn test_fetch_many_reports_progress() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("scoreid", "5"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad id"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let client = client(&server, fast_retries(1));
    let requests: Vec<_> = (0..12).map(box_score).collect();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<BatchProgress>();

    let outcome = client
        .fetch_many(requests, None, &tx, &CancellationToken::new())
        .await
        .unwrap();
    drop(tx);

    assert_eq!(outcome.completed_items, 11);
    assert_eq!(outcome.failed_items, 1);
    assert!(outcome
        .results
        .iter()
        .all(|(request, body)| request.operation() == "box_score" && body == "{}"));

    let mut last = None;
    while let Some(progress) = rx.recv().await {
        last = Some(progress);
    }
    let last = last.unwrap();
    assert!(last.is_completed);
    assert_eq!(last.error_messages.len(), 1);
}

#[tokio::test]
async fn test_invalidate_and_status_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("v"))
        .expect(2)
        .mount(&server)
        .await;

    let client = client(&server, fast_retries(1));
    client.fetch(&box_score(8)).await.unwrap();
    assert_eq!(client.invalidate_matching("^box_score:").unwrap(), 1);
    client.fetch(&box_score(8)).await.unwrap();

    let status = client.status();
    assert_eq!(status.rate_limit.total_issued, 2);
    assert_eq!(status.cache.entries, 1);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["circuit"]["state"], "closed");
    assert_eq!(json["rate_limit"]["total_issued"], 2);
}

#[tokio::test]
async fn test_warm_populates_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("warm"))
        .expect(3)
        .mount(&server)
        .await;

    let client = client(&server, fast_retries(1));
    let requests: Vec<_> = (20..23).map(box_score).collect();

    let report = client
        .warm(requests.clone(), &CancellationToken::new())
        .await;
    assert_eq!(report.warmed, 3);

    for request in &requests {
        assert!(client.cache().exists(&request.cache_key()));
        client.fetch(request).await.unwrap();
    }
}
