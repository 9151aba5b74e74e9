//! HTTP CRM source against a mock server.

use std::time::Duration;

use rollcall_events::CursorState;
use rollcall_sync::{ExternalSource, HttpCrmSource, SourceFault, SourceQuery};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn query() -> SourceQuery {
    SourceQuery::new("contacts", 100).order_by(["createdon", "contactid"])
}

#[tokio::test]
async fn reads_a_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/data/contacts"))
        .and(query_param("pageSize", "100"))
        .and(query_param("page", "2"))
        .and(query_param("pagingCookie", "cookie-2"))
        .and(query_param("orderBy", "createdon,contactid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"contactid": "c-1"}, {"contactid": "c-2"}],
            "moreRecords": true,
            "pagingCookie": "cookie-3"
        })))
        .mount(&server)
        .await;

    let source = HttpCrmSource::new(&server.uri()).unwrap();
    let cursor = CursorState {
        page: 2,
        continuation_token: Some("cookie-2".into()),
    };
    let page = source.fetch_page(&query(), &cursor).await.unwrap();

    assert_eq!(page.rows.len(), 2);
    assert!(page.more_records);
    assert_eq!(page.continuation_token.as_deref(), Some("cookie-3"));
}

#[tokio::test]
async fn last_page_has_no_cookie() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/data/contacts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [],
            "moreRecords": false,
            "pagingCookie": null
        })))
        .mount(&server)
        .await;

    let source = HttpCrmSource::new(&server.uri()).unwrap();
    let page = source
        .fetch_page(&query(), &CursorState::start())
        .await
        .unwrap();
    assert!(page.rows.is_empty());
    assert!(!page.more_records);
    assert!(page.continuation_token.is_none());
}

#[tokio::test]
async fn too_many_requests_is_throttling_with_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;

    let source = HttpCrmSource::new(&server.uri()).unwrap();
    let fault = source
        .fetch_page(&query(), &CursorState::start())
        .await
        .unwrap_err();
    assert_eq!(
        fault,
        SourceFault::throttled(Some(Duration::from_secs(7)))
    );
}

#[tokio::test]
async fn service_unavailable_without_header_is_throttling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let source = HttpCrmSource::new(&server.uri()).unwrap();
    let fault = source
        .fetch_page(&query(), &CursorState::start())
        .await
        .unwrap_err();
    assert_eq!(fault, SourceFault::throttled(None));
}

#[tokio::test]
async fn rejected_paging_cookie_is_invalid_continuation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": "InvalidPagingCookie", "message": "cookie has expired"}
        })))
        .mount(&server)
        .await;

    let source = HttpCrmSource::new(&server.uri()).unwrap();
    let fault = source
        .fetch_page(&query(), &CursorState::start())
        .await
        .unwrap_err();
    assert_eq!(
        fault,
        SourceFault::InvalidContinuation {
            message: "cookie has expired".into()
        }
    );
}

#[tokio::test]
async fn server_error_is_a_genuine_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
        .mount(&server)
        .await;

    let source = HttpCrmSource::new(&server.uri()).unwrap();
    let fault = source
        .fetch_page(&query(), &CursorState::start())
        .await
        .unwrap_err();
    match fault {
        SourceFault::Failed { message } => assert!(message.contains("500")),
        other => panic!("expected a failure, got {other:?}"),
    }
}
