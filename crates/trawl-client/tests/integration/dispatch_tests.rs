use std::time::Duration;

use trawl_core::dispatcher::DispatcherConfig;
use trawl_core::error::FailureKind;
use trawl_core::fetch::FetchResult;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{dispatcher, server_with_robots, stalled_body_server};

#[tokio::test]
async fn fetches_allowed_page() {
    let server = server_with_robots().await;
    Mock::given(method("GET"))
        .and(path("/public"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<h1>ok</h1>"))
        .expect(1)
        .mount(&server)
        .await;

    let result = dispatcher()
        .fetch(&format!("{}/public", server.uri()), None)
        .await;
    let page = result.success().expect("success");
    assert_eq!(page.status_code, 200);
    assert_eq!(page.body, "<h1>ok</h1>");
    assert_eq!(page.attempt, 1);
    assert_eq!(page.engine, "http");
}

#[tokio::test]
async fn robots_disallow_skips_the_request() {
    let server = server_with_robots().await;
    Mock::given(path("/private/page"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let result = dispatcher()
        .fetch(&format!("{}/private/page", server.uri()), None)
        .await;
    let failure = result.failure().expect("failure");
    assert_eq!(failure.kind, FailureKind::RobotsDisallowed);
}

#[tokio::test]
async fn server_error_is_retried_until_success() {
    let server = server_with_robots().await;
    Mock::given(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
        .mount(&server)
        .await;

    let result = dispatcher()
        .fetch(&format!("{}/flaky", server.uri()), None)
        .await;
    let page = result.success().expect("success");
    assert_eq!(page.attempt, 2);
    assert_eq!(page.body, "recovered");
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let server = server_with_robots().await;
    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let result = dispatcher()
        .fetch(&format!("{}/missing", server.uri()), None)
        .await;
    match result {
        FetchResult::Failure(f) => {
            assert_eq!(f.kind, FailureKind::ClientError(404));
            assert_eq!(f.attempt, 1);
        }
        FetchResult::Success(_) => panic!("expected failure"),
    }
}

#[tokio::test]
async fn persistent_rate_limiting_exhausts_retries() {
    let server = server_with_robots().await;
    Mock::given(path("/busy"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let result = dispatcher()
        .fetch(&format!("{}/busy", server.uri()), None)
        .await;
    let failure = result.failure().expect("failure");
    assert_eq!(failure.kind, FailureKind::RetriesExhausted);
    assert_eq!(failure.cause, Some(FailureKind::RateLimited));
    assert_eq!(failure.attempt, 3);
}

#[tokio::test]
async fn missing_robots_allows_everything() {
    let server = wiremock::MockServer::start().await;
    Mock::given(path("/private"))
        .respond_with(ResponseTemplate::new(200).set_body_string("open"))
        .mount(&server)
        .await;

    let result = dispatcher()
        .fetch(&format!("{}/private", server.uri()), None)
        .await;
    assert!(result.is_success());
}

#[tokio::test]
async fn stalled_body_times_out() {
    let base = stalled_body_server().await;
    let dispatcher = dispatcher().with_config(DispatcherConfig {
        request_timeout: Duration::from_millis(300),
        ..DispatcherConfig::default()
    });

    let result = dispatcher.fetch(&format!("{base}/slow"), None).await;
    let failure = result.failure().expect("failure");
    assert_eq!(failure.kind, FailureKind::RetriesExhausted);
    assert_eq!(failure.cause, Some(FailureKind::Timeout));
}
