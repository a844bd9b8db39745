//! HTTP collaborator tests against wiremock servers.

use chrono::{TimeZone, Utc};
use newsflow_adapters::{
    extract, HttpClassifier, NewsApiSource, NewsSource, SearchContext, SentimentClassifier,
};
use newsflow_core::{PipelineRun, RunTrigger, SentimentClass};
use newsflow_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig::default()).expect("client construction should not fail")
}

fn ctx() -> SearchContext {
    SearchContext {
        run_id: Uuid::new_v4(),
        page_size: 20,
        as_of: Utc.with_ymd_and_hms(2024, 8, 1, 12, 0, 0).single().unwrap(),
    }
}

#[tokio::test]
async fn newsapi_search_returns_articles() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/everything"))
        .and(query_param("q", "election"))
        .and(query_param("pageSize", "20"))
        .and(query_param("from", "2024-07-01"))
        .and(query_param("apiKey", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok",
            "totalResults": 1,
            "articles": [{
                "source": {"id": "wire", "name": "Wire Service"},
                "author": "Ana Ruiz",
                "title": "Turnout rises",
                "description": "Early voting numbers",
                "url": "https://example.com/turnout",
                "urlToImage": "https://example.com/turnout.jpg",
                "publishedAt": "2024-07-30T08:15:00Z",
                "content": "Turnout rose sharply in early voting."
            }]
        })))
        .mount(&server)
        .await;

    let source = NewsApiSource::new(fetcher(), "test-key").with_base_url(server.uri());
    let articles = source.search(&ctx(), "election").await.expect("search should succeed");

    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0].title.as_deref(), Some("Turnout rises"));
    assert_eq!(articles[0].published_at.as_deref(), Some("2024-07-30T08:15:00Z"));
}

#[tokio::test]
async fn newsapi_error_body_is_a_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/everything"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "error",
            "code": "rateLimited",
            "message": "You have made too many requests recently."
        })))
        .mount(&server)
        .await;

    let source = NewsApiSource::new(fetcher(), "k").with_base_url(server.uri());
    let err = source.search(&ctx(), "tech").await.unwrap_err();
    assert!(matches!(err, FetchError::Api { ref code, .. } if code == "rateLimited"));
}

#[tokio::test]
async fn non_success_status_fails_extraction_without_leaking_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/everything"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let source = NewsApiSource::new(fetcher(), "super-secret").with_base_url(server.uri());
    let run = PipelineRun::new(vec!["tech".into(), "economy".into()], 10, RunTrigger::Manual);
    let err = extract(&source, &run).await.unwrap_err();

    match err {
        FetchError::HttpStatus { status, ref url } => {
            assert_eq!(status, 503);
            assert!(!url.contains("super-secret"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn http_classifier_reads_nested_label_scores() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/sentiment"))
        .and(header("authorization", "Bearer hf-token"))
        .and(body_json(json!({
            "inputs": "Shares jumped",
            "parameters": { "truncation": true }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([[
            {"label": "LABEL_2", "score": 0.85},
            {"label": "LABEL_1", "score": 0.10},
            {"label": "LABEL_0", "score": 0.05}
        ]])))
        .mount(&server)
        .await;

    let classifier = HttpClassifier::new(
        fetcher(),
        format!("{}/models/sentiment", server.uri()),
        Some("hf-token".into()),
    );
    let score = classifier.classify("Shares jumped").await.expect("classify");
    assert_eq!(score.predicted_class(), SentimentClass::Positive);
    assert_eq!(score.probabilities(), [0.05, 0.10, 0.85]);
}

#[tokio::test]
async fn http_classifier_rejects_invalid_distribution() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"label": "negative", "score": 0.9},
            {"label": "neutral", "score": 0.9},
            {"label": "positive", "score": 0.9}
        ])))
        .mount(&server)
        .await;

    let classifier = HttpClassifier::new(fetcher(), server.uri(), None);
    assert!(classifier.classify("anything").await.is_err());
}
