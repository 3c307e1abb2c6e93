mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{open_quiz, Backend};
use videoquiz_client::api::ApiClient;
use videoquiz_client::app_state::{AppData, AppDataStore, RefreshOutcome};
use videoquiz_client::auth::AuthStore;
use videoquiz_client::certificates::Certificates;
use videoquiz_client::config::{ClientConfig, RefreshPolicy};
use videoquiz_client::error::CertificateError;
use videoquiz_client::models::Credentials;
use videoquiz_client::quiz::SubmitReason;
use videoquiz_client::routes::{Navigator, Route};
use videoquiz_client::signals::SignalBus;
use videoquiz_client::storage::{LocalStorage, QUIZ_COMPLETED};
use videoquiz_client::views::DashboardView;

fn client(server: &MockServer, storage: LocalStorage) -> ApiClient {
    let config = ClientConfig {
        api_url: format!("{}/api/", server.uri()),
        ..ClientConfig::default()
    };
    ApiClient::new(&config, storage).unwrap()
}

fn videos(n: i64) -> serde_json::Value {
    (1..=n)
        .map(|id| json!({"id": id, "title": format!("Lesson {id}"), "sequence_number": id, "time_limit": 10}))
        .collect()
}

fn refs(ids: &[i64]) -> serde_json::Value {
    ids.iter().map(|id| json!({"id": id, "title": ""})).collect()
}

async fn mount_catalog(server: &MockServer, delay: Duration) {
    Mock::given(method("GET"))
        .and(path("/api/videos/videos/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(videos(5))
                .set_delay(delay),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/videos/videos/unlocked/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(videos(5)))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/auth/progress/my_progress/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "videos_passed": refs(&[1, 2, 3]),
            "videos_failed": refs(&[4]),
            "total_retries": 2,
            "overall_progress": "60.00"
        })))
        .mount(server)
        .await;
}

async fn catalog_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/api/videos/videos/")
        .count()
}

#[tokio::test]
async fn concurrent_refresh_makes_one_round_trip() {
    let server = MockServer::start().await;
    mount_catalog(&server, Duration::from_millis(300)).await;

    let api = Arc::new(client(&server, LocalStorage::in_memory()));
    let store = AppDataStore::new(api, RefreshPolicy::default());
    let (a, b) = tokio::join!(store.refresh(), store.refresh());

    let mut outcomes = [a, b];
    outcomes.sort_by_key(|o| *o != RefreshOutcome::Refreshed);
    assert_eq!(outcomes, [RefreshOutcome::Refreshed, RefreshOutcome::Skipped]);
    assert_eq!(catalog_requests(&server).await, 1);
}

#[tokio::test]
async fn dashboard_shows_sixty_percent_and_no_certificate() {
    let server = MockServer::start().await;
    mount_catalog(&server, Duration::ZERO).await;
    Mock::given(method("GET"))
        .and(path("/api/auth/certificates/my_certificates/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/certificates/generate/"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let api = client(&server, LocalStorage::in_memory());
    let store = AppDataStore::new(Arc::new(api.clone()), RefreshPolicy::default());
    assert_eq!(store.refresh().await, RefreshOutcome::Refreshed);

    let view = DashboardView::from_data(&store.snapshot());
    assert_eq!(view.total, 5);
    assert_eq!(view.completion, 60);
    assert_eq!(view.overall_progress, 60.0);
    assert!(!view.certificate_ready);

    let mut certs = Certificates::load(api).await.unwrap();
    assert!(matches!(
        certs.generate().await,
        Err(CertificateError::NotEligible { passed: 3, total: 5 })
    ));
}

#[tokio::test]
async fn login_rejection_surfaces_the_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/token/"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"non_field_errors": ["Invalid credentials"]})),
        )
        .mount(&server)
        .await;

    let auth = AuthStore::new(client(&server, LocalStorage::in_memory()));
    let err = auth
        .login(&Credentials {
            username: "sam".into(),
            password: "nope".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, "Invalid credentials");
    assert_eq!(auth.current().error(), Some("Invalid credentials"));
}

async fn wait_for(rx: &mut tokio::sync::watch::Receiver<AppData>, refreshes: usize, server: &MockServer) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let settled = {
                let data = rx.borrow_and_update();
                !data.loading && data.last_updated.is_some()
            };
            if settled && catalog_requests(server).await >= refreshes {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .unwrap();
}

async fn completion_marker_refreshes_the_dashboard(dashboard_tab: LocalStorage, quiz_tab: LocalStorage) {
    let server = MockServer::start().await;
    mount_catalog(&server, Duration::ZERO).await;

    let store = Arc::new(AppDataStore::new(
        Arc::new(client(&server, dashboard_tab.clone())),
        RefreshPolicy::default(),
    ));
    let mut rx = store.subscribe();
    let nav = Navigator::new(Route::Dashboard);
    let dir_watch = dashboard_tab.spawn_dir_watch(Duration::from_millis(20));
    let _sync = store
        .clone()
        .spawn_sync(&SignalBus::new(), &dashboard_tab, nav.subscribe());
    wait_for(&mut rx, 1, &server).await;
    assert_eq!(catalog_requests(&server).await, 1);

    let backend = Arc::new(Backend::new(2, 600));
    let quiz = open_quiz(&backend, quiz_tab.clone());
    quiz.quiz.load().await.unwrap();
    quiz.quiz.mark_watched().await.unwrap();
    quiz.quiz.select_answer(1, 11).unwrap().await.unwrap();
    quiz.quiz.submit(SubmitReason::Manual).await.unwrap();

    wait_for(&mut rx, 2, &server).await;
    assert_eq!(catalog_requests(&server).await, 2);
    // the observing side clears the marker
    tokio::time::timeout(Duration::from_secs(2), async {
        while quiz_tab.get(QUIZ_COMPLETED).unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    if let Some(task) = dir_watch {
        task.abort();
    }
}

#[tokio::test]
async fn finishing_a_quiz_in_one_tab_refreshes_another() {
    let storage = LocalStorage::in_memory();
    completion_marker_refreshes_the_dashboard(storage.new_tab(), storage).await;
}

#[tokio::test]
async fn finishing_a_quiz_in_another_process_refreshes_the_dashboard() {
    let dir = tempfile::tempdir().unwrap();
    let dashboard = LocalStorage::open(dir.path()).unwrap();
    let quiz = LocalStorage::open(dir.path()).unwrap();
    completion_marker_refreshes_the_dashboard(dashboard, quiz).await;
}
