//! Tests for the dispatch pipeline: registration through synthesized
//! response

use super::*;
use crate::{
    builder::RecipeBuilder,
    registry::Registry,
    test_util::{get, header_map, registry, request},
};
use bytes::Bytes;
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use rstest::rstest;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use tokio_util::sync::CancellationToken;

async fn dispatch(
    registry: &Arc<Registry>,
    request: &InterceptedRequest,
) -> Result<SynthesizedResponse, DispatchError> {
    Interceptor::new(Arc::clone(registry)).dispatch(request).await
}

/// Dispatch and resolve the response body to bytes
async fn dispatch_body(
    registry: &Arc<Registry>,
    request: &InterceptedRequest,
) -> Bytes {
    dispatch(registry, request)
        .await
        .unwrap()
        .body
        .into_bytes()
        .await
        .unwrap()
}

#[rstest]
#[tokio::test]
async fn test_minimal_get(registry: Arc<Registry>) {
    RecipeBuilder::new()
        .requests()
        .method(HttpMethod::Get)
        .scheme("https")
        .host("api.example")
        .path("/terms")
        .responds()
        .json(&serde_json::json!({"id": 1}))
        .register_with(&registry)
        .unwrap();

    let response = dispatch(&registry, &get("https://api.example/terms"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.content_headers["content-type"],
        "application/json"
    );
    assert_eq!(
        response.body.into_bytes().await.unwrap().as_ref(),
        br#"{"id":1}"#
    );
}

/// A recipe with only a host matches any method and scheme, which is all a
/// fault-injection stub needs
#[rstest]
#[tokio::test]
async fn test_fault_injection(registry: Arc<Registry>) {
    RecipeBuilder::new()
        .host("api.example")
        .status(500)
        .register_with(&registry)
        .unwrap();

    let response = dispatch(&registry, &get("http://api.example/"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    // Faults are structured responses, not errors; translating 5xx into a
    // failure is the host client's business
    let response =
        dispatch(&registry, &request(HttpMethod::Post, "https://api.example/x"))
            .await
            .unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[rstest]
#[tokio::test]
async fn test_scope_override(registry: Arc<Registry>) {
    RecipeBuilder::new()
        .host("api.example")
        .json(&serde_json::json!({"v": 1}))
        .register_with(&registry)
        .unwrap();

    let scope = registry.begin_scope();
    RecipeBuilder::new()
        .host("api.example")
        .json(&serde_json::json!({"v": 2}))
        .register_with(&registry)
        .unwrap();
    assert_eq!(
        dispatch_body(&registry, &get("https://api.example/")).await.as_ref(),
        br#"{"v":2}"#
    );
    registry.end_scope(scope);

    assert_eq!(
        dispatch_body(&registry, &get("https://api.example/")).await.as_ref(),
        br#"{"v":1}"#
    );
}

/// Predicate recipes: the highest priority accepting candidate wins;
/// an unset priority sorts below every explicit one
#[rstest]
#[case::exact_host("https://google.com/", "A")]
#[case::contains_host("https://google.co.uk/", "B")]
#[case::catch_all("https://example.org/", "D")]
#[tokio::test]
async fn test_predicate_priority(
    registry: Arc<Registry>,
    #[case] url: &str,
    #[case] expected: &str,
) {
    RecipeBuilder::new()
        .matched_by(|request| request.url().host_str() == Some("google.com"))
        .priority(2)
        .content("A")
        .register_with(&registry)
        .unwrap();
    RecipeBuilder::new()
        .matched_by(|request| {
            request
                .url()
                .host_str()
                .is_some_and(|host| host.contains("google"))
        })
        .priority(1)
        .content("B")
        .register_with(&registry)
        .unwrap();
    RecipeBuilder::new()
        .matched_by(|_| true)
        .content("D")
        .register_with(&registry)
        .unwrap();

    assert_eq!(dispatch_body(&registry, &get(url)).await.as_ref(), expected.as_bytes());
}

#[rstest]
#[tokio::test]
async fn test_missing_strict(registry: Arc<Registry>) {
    registry.set_strict(true);
    let error = dispatch(&registry, &get("https://api.example/"))
        .await
        .unwrap_err();
    assert!(
        matches!(error, DispatchError::Unmatched { .. }),
        "unexpected error: {error}"
    );
    assert!(error.to_string().contains("https://api.example/"));
}

/// In permissive mode an unmatched request gets the sentinel empty 200
#[rstest]
#[tokio::test]
async fn test_missing_permissive(registry: Arc<Registry>) {
    let response = dispatch(&registry, &get("https://api.example/"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.headers.is_empty());
    assert_eq!(response.body.into_bytes().await.unwrap().as_ref(), b"");
}

/// Two recipes on the same URI differing only in a required header are
/// distinct registrations; the request's headers pick between them
#[rstest]
#[case::json("application/json", br#"{"d":1}"# as &[u8])]
#[case::diff("application/diff", b"@@ -1 +1 @@")]
#[tokio::test]
async fn test_content_negotiation(
    registry: Arc<Registry>,
    #[case] accept: &str,
    #[case] expected: &[u8],
) {
    RecipeBuilder::new()
        .method(HttpMethod::Get)
        .host("api.example")
        .path("/data")
        .requires_header("Accept", "application/json")
        .json(&serde_json::json!({"d": 1}))
        .register_with(&registry)
        .unwrap();
    RecipeBuilder::new()
        .method(HttpMethod::Get)
        .host("api.example")
        .path("/data")
        .requires_header("Accept", "application/diff")
        .content(&b"@@ -1 +1 @@"[..])
        .register_with(&registry)
        .unwrap();

    let request = get("https://api.example/data")
        .with_headers(header_map([("Accept", accept)]));
    assert_eq!(dispatch_body(&registry, &request).await.as_ref(), expected);
}

/// Registering snapshots the builder; mutating it afterwards only affects
/// later registrations
#[rstest]
#[tokio::test]
async fn test_registration_snapshot(registry: Arc<Registry>) {
    let builder = RecipeBuilder::new()
        .host("first.example")
        .status(201)
        .register_with(&registry)
        .unwrap();
    // Mutate the same builder for a second registration on another host
    builder
        .host("second.example")
        .status(418)
        .register_with(&registry)
        .unwrap();

    let response = dispatch(&registry, &get("https://first.example/"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::CREATED);
    let response = dispatch(&registry, &get("https://second.example/"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::IM_A_TEAPOT);
}

/// A single-use recipe dispatches at most once, then requests fall through
/// to the next candidate or the missing path
#[rstest]
#[tokio::test]
async fn test_single_use(registry: Arc<Registry>) {
    RecipeBuilder::new()
        .host("api.example")
        .status(503)
        .single_use()
        .register_with(&registry)
        .unwrap();

    let first = dispatch(&registry, &get("https://api.example/"))
        .await
        .unwrap();
    assert_eq!(first.status, StatusCode::SERVICE_UNAVAILABLE);
    // Consumed: the permissive sentinel takes over
    let second = dispatch(&registry, &get("https://api.example/"))
        .await
        .unwrap();
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(registry.recipe_count(), 0);
}

/// A cancellation signal that fired before dispatch short-circuits without
/// invoking any user callback
#[rstest]
#[tokio::test]
async fn test_cancellation_before_dispatch(registry: Arc<Registry>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    RecipeBuilder::new()
        .host("api.example")
        .on_request(move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .register_with(&registry)
        .unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let request =
        get("https://api.example/").with_cancellation(token);

    let error = dispatch(&registry, &request).await.unwrap_err();
    assert!(matches!(error, DispatchError::Cancelled));
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

/// A signal firing mid-callback propagates `Cancelled` instead of returning
/// a half-built response
#[rstest]
#[tokio::test]
async fn test_cancellation_during_callback(registry: Arc<Registry>) {
    RecipeBuilder::new()
        .host("api.example")
        .on_request_async(|request, _| {
            let token = request.cancellation().clone();
            async move {
                // Fire the request's own signal, then hang: the dispatcher
                // must abandon us
                token.cancel();
                futures::future::pending::<()>().await;
                Ok(())
            }
        })
        .register_with(&registry)
        .unwrap();

    let error = dispatch(&registry, &get("https://api.example/"))
        .await
        .unwrap_err();
    assert!(matches!(error, DispatchError::Cancelled));
}

/// Callback failures propagate unchanged
#[rstest]
#[tokio::test]
async fn test_callback_error_propagates(registry: Arc<Registry>) {
    RecipeBuilder::new()
        .host("api.example")
        .on_request(|_, _| Err(anyhow::anyhow!("user callback exploded")))
        .register_with(&registry)
        .unwrap();

    let error = dispatch(&registry, &get("https://api.example/"))
        .await
        .unwrap_err();
    assert_eq!(error.to_string(), "user callback exploded");
}

/// Header requirements match case-insensitively on name and value, and
/// reject absence
#[rstest]
#[case::canonical(Some(("Accept", "application/json")), true)]
#[case::shouting(Some(("accept", "APPLICATION/JSON")), true)]
#[case::absent(None, false)]
#[tokio::test]
async fn test_header_requirement(
    registry: Arc<Registry>,
    #[case] header: Option<(&str, &str)>,
    #[case] expected_match: bool,
) {
    RecipeBuilder::new()
        .host("api.example")
        .requires_header("Accept", "application/json")
        .content("matched")
        .register_with(&registry)
        .unwrap();

    let request =
        get("https://api.example/").with_headers(header_map(header));
    let body = dispatch_body(&registry, &request).await;
    let expected: &[u8] = if expected_match { b"matched" } else { b"" };
    assert_eq!(body.as_ref(), expected);
}

/// A content predicate buffers the body; the pre-dispatch callback replays
/// identical bytes
#[rstest]
#[tokio::test]
async fn test_body_replay(registry: Arc<Registry>) {
    let seen = Arc::new(Mutex::new(None::<Bytes>));
    let sink = Arc::clone(&seen);
    RecipeBuilder::new()
        .host("api.example")
        .body_matches(|body| body.starts_with(b"{"))
        .on_request(move |request, _| {
            let bytes = request.body().bytes()?.clone();
            sink.lock().unwrap().replace(bytes);
            Ok(())
        })
        .content("ok")
        .register_with(&registry)
        .unwrap();

    let request = request(HttpMethod::Post, "https://api.example/")
        .with_body(RequestBody::from_reader(std::io::Cursor::new(
            br#"{"id":1}"#.to_vec(),
        )));
    assert_eq!(dispatch_body(&registry, &request).await.as_ref(), b"ok");
    assert_eq!(
        seen.lock().unwrap().as_deref(),
        Some(br#"{"id":1}"#.as_slice())
    );
}

/// Thunks are re-evaluated on every dispatch of a reusable recipe; produced
/// values are never cached
#[rstest]
#[tokio::test]
async fn test_thunk_freshness(registry: Arc<Registry>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let header_counter = Arc::clone(&counter);
    RecipeBuilder::new()
        .host("api.example")
        .response_headers_thunk(move || {
            let count = header_counter.fetch_add(1, Ordering::Relaxed);
            Ok(header_map([("X-Count", count.to_string().as_str())]))
        })
        .content_thunk({
            let counter = Arc::new(AtomicUsize::new(0));
            move || {
                let count = counter.fetch_add(1, Ordering::Relaxed);
                Ok(format!("body-{count}").into())
            }
        })
        .register_with(&registry)
        .unwrap();

    let first = dispatch(&registry, &get("https://api.example/"))
        .await
        .unwrap();
    let second = dispatch(&registry, &get("https://api.example/"))
        .await
        .unwrap();
    assert_eq!(first.headers["x-count"], "0");
    assert_eq!(second.headers["x-count"], "1");
    assert_eq!(first.body.into_bytes().await.unwrap().as_ref(), b"body-0");
    assert_eq!(second.body.into_bytes().await.unwrap().as_ref(), b"body-1");
}

/// Async content thunks run under the cancellation signal
#[rstest]
#[tokio::test]
async fn test_async_content_thunk(registry: Arc<Registry>) {
    RecipeBuilder::new()
        .host("api.example")
        .content_async(|| async { Ok(Bytes::from_static(b"eventually")) })
        .register_with(&registry)
        .unwrap();

    assert_eq!(
        dispatch_body(&registry, &get("https://api.example/")).await.as_ref(),
        b"eventually"
    );
}

/// The stream opener runs per dispatch, so a reusable recipe yields a full
/// fresh stream every time
#[rstest]
#[tokio::test]
async fn test_stream_content_fresh_per_dispatch(registry: Arc<Registry>) {
    RecipeBuilder::new()
        .host("api.example")
        .content_stream(|| {
            Ok(futures::stream::iter([
                Ok(Bytes::from_static(b"chunk-1 ")),
                Ok(Bytes::from_static(b"chunk-2")),
            ]))
        })
        .register_with(&registry)
        .unwrap();

    for _ in 0..2 {
        let response = dispatch(&registry, &get("https://api.example/"))
            .await
            .unwrap();
        assert!(matches!(response.body, ResponseBody::Stream(_)));
        assert_eq!(
            response.body.into_bytes().await.unwrap().as_ref(),
            b"chunk-1 chunk-2"
        );
    }
}

/// Registry-level mutators apply to every synthesized response
#[rstest]
#[tokio::test]
async fn test_global_mutators(registry: Arc<Registry>) {
    RecipeBuilder::new()
        .host("api.example")
        .register_with(&registry)
        .unwrap();
    registry.mutate_responses(|response| {
        response.headers.insert(
            reqwest::header::HeaderName::from_static("x-intercepted"),
            reqwest::header::HeaderValue::from_static("true"),
        );
    });

    let response = dispatch(&registry, &get("https://api.example/"))
        .await
        .unwrap();
    assert_eq!(response.headers["x-intercepted"], "true");
}

/// The fallback producer can answer for unmatched requests or abstain; an
/// abstention falls through to strict failure
#[rstest]
#[tokio::test]
async fn test_fallback_producer(registry: Arc<Registry>) {
    registry.set_strict(true);
    registry.on_unmatched(|request| {
        (request.url().path() == "/known").then(|| {
            let mut response = SynthesizedResponse::empty();
            response.status = StatusCode::NO_CONTENT;
            response
        })
    });

    let response = dispatch(&registry, &get("https://api.example/known"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::NO_CONTENT);

    let error = dispatch(&registry, &get("https://api.example/unknown"))
        .await
        .unwrap_err();
    assert!(matches!(error, DispatchError::Unmatched { .. }));
}

#[rstest]
#[tokio::test]
async fn test_version_and_reason(registry: Arc<Registry>) {
    RecipeBuilder::new()
        .host("api.example")
        .status(500)
        .reason("Cascading Failure")
        .version(HttpVersion::Http2)
        .register_with(&registry)
        .unwrap();

    let response = dispatch(&registry, &get("https://api.example/"))
        .await
        .unwrap();
    assert_eq!(response.version, HttpVersion::Http2);
    assert_eq!(response.reason_phrase(), "Cascading Failure");
}

/// Round trip across the reqwest seam: a reqwest request converts in, the
/// synthesized response converts out as an [http::Response]
#[rstest]
#[tokio::test]
async fn test_reqwest_seam(registry: Arc<Registry>) {
    RecipeBuilder::new()
        .method(HttpMethod::Post)
        .host("api.example")
        .path("/submit")
        .body_matches(|body| body == b"payload")
        .status(202)
        .content("accepted")
        .register_with(&registry)
        .unwrap();

    let mut outgoing = reqwest::Request::new(
        reqwest::Method::POST,
        "https://api.example/submit".parse().unwrap(),
    );
    *outgoing.body_mut() = Some(reqwest::Body::from("payload"));
    let request = InterceptedRequest::try_from(&outgoing).unwrap();

    let response = InterceptHook::new(Arc::clone(&registry))
        .handle(&request)
        .await
        .unwrap()
        .into_http();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()[reqwest::header::CONTENT_LENGTH], "8");
    assert_eq!(
        response.into_body().into_bytes().await.unwrap().as_ref(),
        b"accepted"
    );
}
