//! Tests for the coordinator's HTTP surface

use crate::api::{create_router, AppState, ControllerEntry, CoordinatorState};
use crate::controller::TaskController;
use crate::registry::ClientRegistry;
use crate::scheduler::{Scheduler, SLEEP_DELAY};
use crate::store::StoreBackend;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use shared::multipart::{self, FilePart};
use shared::protocol::Command;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{broadcast, watch, Mutex};
use tower::ServiceExt; // for `oneshot`

/// Build a router over a fresh coordinator with an ISSUE task fanning out
/// into an ARTICLE task. The TempDir must be kept alive for the test
/// duration.
fn create_test_app() -> (axum::Router, AppState, TempDir) {
    let tmp = TempDir::new().unwrap();
    let state_dir = tmp.path().join("db");

    let scheduler = Scheduler::new(1);
    let registry = ClientRegistry::open(StoreBackend::Dir, &state_dir).unwrap();

    let article = TaskController::open(
        StoreBackend::Dir,
        &state_dir,
        "articles",
        "ARTICLE",
        &tmp.path().join("article_archive"),
        ".xml.gz",
    )
    .unwrap();
    let issue = TaskController::open(
        StoreBackend::Dir,
        &state_dir,
        "issues",
        "ISSUE",
        &tmp.path().join("issue_archive"),
        ".txt",
    )
    .unwrap();

    let state = Arc::new(Mutex::new(CoordinatorState {
        scheduler,
        registry,
        controllers: vec![
            ControllerEntry {
                path: "article".to_string(),
                fan_out: None,
                controller: article,
            },
            ControllerEntry {
                path: "issue".to_string(),
                fan_out: Some("ARTICLE".to_string()),
                controller: issue,
            },
        ],
    }));

    let (interval_tx, _interval_rx) = watch::channel(1);
    let (shutdown_tx, _) = broadcast::channel(1);
    let app_state = AppState {
        state,
        interval_tx,
        shutdown_tx,
    };
    let router = create_router(app_state.clone(), 10 * 1024 * 1024);
    (router, app_state, tmp)
}

fn ping_request(client_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri("/ping");
    if let Some(id) = client_id {
        builder = builder
            .header("client-id", id)
            .header("client-hostname", "w.example.org")
            .header("client-version", "0.3.0")
            .header("client-arver", "0.3.1");
    }
    builder.body(Body::empty()).unwrap()
}

fn upload_request(task: &str, sid: &str, extra_fields: &[(&str, &str)]) -> Request<Body> {
    let mut fields = vec![("article-sid", sid)];
    fields.extend_from_slice(extra_fields);
    let body = multipart::encode_form(
        &fields,
        &[FilePart {
            name: "article-data",
            filename: "payload.gz",
            data: b"\x1f\x8bpayload",
        }],
    );
    Request::builder()
        .method(Method::POST)
        .uri(format!("/{}/{}", task, sid))
        .header("client-id", "worker-1")
        .header("content-type", multipart::content_type())
        .body(Body::from(body))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_ping_without_client_id_mutates_nothing() {
    let (router, app, _tmp) = create_test_app();

    let response = router.oneshot(ping_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let state = app.state.lock().await;
    assert_eq!(state.scheduler.peer_count(), 0);
    assert_eq!(state.registry.client_count().unwrap(), 0);
}

#[tokio::test]
async fn test_ping_with_no_work_returns_sleep() {
    let (router, _app, _tmp) = create_test_app();

    let response = router.oneshot(ping_request(Some("worker-1"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let command = Command::parse(&body_text(response).await).unwrap();
    assert!(command.is_sleep());
}

#[tokio::test]
async fn test_assignment_and_upload_round_trip() {
    let (router, app, _tmp) = create_test_app();

    // Register two jobs and let two beats promote them
    {
        let mut state = app.state.lock().await;
        let state = &mut *state;
        state.controllers[0]
            .controller
            .add_job(&mut state.scheduler, "A")
            .unwrap();
        state.controllers[0]
            .controller
            .add_job(&mut state.scheduler, "B")
            .unwrap();
        state.scheduler.beat();
        state.scheduler.beat();
    }

    let response = router
        .clone()
        .oneshot(ping_request(Some("worker-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let command = Command::parse(&body_text(response).await).unwrap();
    assert_eq!(command.action, "ARTICLE");
    let sid = command.params;

    // Upload the result for whichever job we were handed
    let response = router
        .clone()
        .oneshot(upload_request("article", &sid, &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let command = Command::parse(&body_text(response).await).unwrap();
    assert!(command.is_sleep());
    assert!(command.params.parse::<u64>().unwrap() >= SLEEP_DELAY);

    let state = app.state.lock().await;
    assert!(state.controllers[0].controller.is_done(&sid).unwrap());
    assert!(!state.controllers[0].controller.is_pending(&sid).unwrap());
    assert_eq!(state.registry.jobs_done("worker-1"), 1);
}

#[tokio::test]
async fn test_duplicate_upload_is_accepted_once() {
    let (router, app, _tmp) = create_test_app();

    {
        let mut state = app.state.lock().await;
        let state = &mut *state;
        state.controllers[0]
            .controller
            .add_job(&mut state.scheduler, "Z")
            .unwrap();
        state.scheduler.beat();
    }

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(upload_request("article", "Z", &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let state = app.state.lock().await;
    assert!(state.controllers[0].controller.is_done("Z").unwrap());
    // The second upload of the same result does not count again
    assert_eq!(state.registry.jobs_done("worker-1"), 1);
}

#[tokio::test]
async fn test_upload_with_slashes_in_params() {
    let (router, app, tmp) = create_test_app();

    {
        let mut state = app.state.lock().await;
        let state = &mut *state;
        state.controllers[0]
            .controller
            .add_job(&mut state.scheduler, "2006/10/11/123123")
            .unwrap();
    }

    let response = router
        .oneshot(upload_request("article", "2006/10/11/123123", &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let artifact = tmp
        .path()
        .join("article_archive")
        .join("2006_10_11_123123.xml.gz");
    assert!(artifact.is_file());
}

#[tokio::test]
async fn test_issue_upload_seeds_article_jobs() {
    let (router, app, _tmp) = create_test_app();

    {
        let mut state = app.state.lock().await;
        let state = &mut *state;
        state.controllers[1]
            .controller
            .add_job(&mut state.scheduler, "20081211")
            .unwrap();
    }

    let response = router
        .oneshot(upload_request(
            "issue",
            "20081211",
            &[("sids", "1105010/423 1105011/99")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let state = app.state.lock().await;
    assert!(state.controllers[1].controller.is_done("20081211").unwrap());
    assert!(state.controllers[0]
        .controller
        .is_pending("1105010/423")
        .unwrap());
    assert!(state.controllers[0]
        .controller
        .is_pending("1105011/99")
        .unwrap());
    assert!(state.scheduler.holds_job("ARTICLE", "1105010/423"));
}

#[tokio::test]
async fn test_upload_to_unknown_task_is_not_found() {
    let (router, _app, _tmp) = create_test_app();
    let response = router
        .oneshot(upload_request("comments", "1", &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_missing_payload_field_is_rejected() {
    let (router, _app, _tmp) = create_test_app();
    let body = multipart::encode_form(&[("article-sid", "X")], &[]);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/article/X")
        .header("client-id", "worker-1")
        .header("content-type", multipart::content_type())
        .body(Body::from(body))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_nothing_error_moves_job_to_erroneous() {
    let (router, app, _tmp) = create_test_app();

    {
        let mut state = app.state.lock().await;
        let state = &mut *state;
        state.controllers[0]
            .controller
            .add_job(&mut state.scheduler, "404/1")
            .unwrap();
    }

    let request = Request::builder()
        .method(Method::GET)
        .uri("/article/nothing-error/404/1")
        .header("client-id", "worker-1")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let command = Command::parse(&body_text(response).await).unwrap();
    assert!(command.is_sleep());

    let state = app.state.lock().await;
    assert!(state.controllers[0].controller.is_erroneous("404/1").unwrap());
    assert!(!state.controllers[0].controller.is_pending("404/1").unwrap());
}

#[tokio::test]
async fn test_nothing_error_for_unknown_job_is_rejected() {
    let (router, _app, _tmp) = create_test_app();
    let request = Request::builder()
        .method(Method::GET)
        .uri("/article/nothing-error/ghost")
        .header("client-id", "worker-1")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_manage_page_shows_scheduler_status() {
    let (router, _app, _tmp) = create_test_app();
    let request = Request::builder()
        .method(Method::GET)
        .uri("/manage")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page = body_text(response).await;
    assert!(page.contains("Scheduler Status"));
    assert!(page.contains("ARTICLE Status"));
    assert!(page.contains("ISSUE Status"));
}

#[tokio::test]
async fn test_manage_post_reschedules_the_beat() {
    let (router, app, _tmp) = create_test_app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/manage")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from("interval=5"))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let state = app.state.lock().await;
    assert_eq!(state.scheduler.interval(), 5);
    assert_eq!(*app.interval_tx.borrow(), 5);
}

#[tokio::test]
async fn test_quitquitquit_signals_shutdown() {
    let (router, app, _tmp) = create_test_app();
    let mut shutdown_rx = app.shutdown_tx.subscribe();

    let request = Request::builder()
        .method(Method::GET)
        .uri("/quitquitquit")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(shutdown_rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_clients_page_lists_known_workers() {
    let (router, _app, _tmp) = create_test_app();

    let response = router
        .clone()
        .oneshot(ping_request(Some("worker-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .method(Method::GET)
        .uri("/clients")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page = body_text(response).await;
    assert!(page.contains("worker-1"));
    assert!(page.contains("ALIVE"));
}
