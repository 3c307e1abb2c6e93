use async_trait::async_trait;
use chrono::Utc;
use http::{Method, StatusCode};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::models::*;
use crate::storage::LocalStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Auth {
    Bearer,
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base: Url,
    storage: LocalStorage,
    expired: broadcast::Sender<()>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, storage: LocalStorage) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(config.http_timeout).build()?;
        let base = Url::parse(&config.api_url).map_err(|e| ApiError::Url(e.to_string()))?;
        let (expired, _) = broadcast::channel(4);
        Ok(Self {
            http,
            base,
            storage,
            expired,
        })
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    /// Fires every time a token refresh fails and the persisted tokens are
    /// dropped. Shared by all clones of this client.
    pub fn session_expired(&self) -> broadcast::Receiver<()> {
        self.expired.subscribe()
    }

    // --- auth ---

    /// Exchange credentials for a token pair. Does not persist anything.
    pub async fn obtain_tokens(&self, credentials: &Credentials) -> Result<TokenPair, ApiError> {
        self.json(Method::POST, "auth/token/", &[], Some(body(credentials)?), Auth::Anonymous)
            .await
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        self.send(Method::POST, "auth/users/logout/", &[], None, Auth::Bearer)
            .await
            .map(drop)
    }

    pub async fn current_user(&self) -> Result<User, ApiError> {
        self.json(Method::GET, "auth/users/me/", &[], None, Auth::Bearer)
            .await
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<User, ApiError> {
        self.json(Method::PUT, "auth/users/me/", &[], Some(body(update)?), Auth::Bearer)
            .await
    }

    // --- media ---

    pub fn stream_url(&self, video: VideoId) -> Result<Url, ApiError> {
        self.base
            .join(&format!("videos/videos/{video}/stream_video/"))
            .map_err(|e| ApiError::Url(e.to_string()))
    }

    // --- history and certificates ---

    pub async fn attempts(&self) -> Result<Vec<QuizAttempt>, ApiError> {
        self.json(Method::GET, "quizzes/attempts/", &[], None, Auth::Bearer)
            .await
    }

    pub async fn result(&self, attempt: AttemptId) -> Result<QuizResult, ApiError> {
        let path = format!("quizzes/attempts/{attempt}/result/");
        self.json(Method::GET, &path, &[], None, Auth::Bearer).await
    }

    pub async fn certificates(&self) -> Result<Vec<Certificate>, ApiError> {
        self.json(Method::GET, "auth/certificates/my_certificates/", &[], None, Auth::Bearer)
            .await
    }

    pub async fn generate_certificate(&self) -> Result<Certificate, ApiError> {
        self.json(Method::POST, "auth/certificates/generate/", &[], None, Auth::Bearer)
            .await
    }

    pub async fn download_certificate(&self, id: CertificateId) -> Result<Vec<u8>, ApiError> {
        let path = format!("auth/certificates/{id}/download/");
        let response = self.send(Method::GET, &path, &[], None, Auth::Bearer).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // --- plumbing ---

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, ApiError> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| ApiError::Url(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
            pairs.append_pair("_t", &Utc::now().timestamp_millis().to_string());
        }
        Ok(url)
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
        token: Option<&str>,
    ) -> Result<Response, ApiError> {
        let url = self.url(path, query)?;
        debug!(%method, %url, "api request");
        let mut req = self.http.request(method, url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
        auth: Auth,
    ) -> Result<Response, ApiError> {
        let token = match auth {
            Auth::Bearer => self.storage.access_token()?,
            Auth::Anonymous => None,
        };
        let response = self
            .dispatch(method.clone(), path, query, body.as_ref(), token.as_deref())
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED || auth == Auth::Anonymous {
            return check(response).await;
        }
        let Some(refresh) = self.storage.refresh_token()? else {
            return check(response).await;
        };

        let access = self.refresh_access(&refresh).await?;
        let retried = self
            .dispatch(method, path, query, body.as_ref(), Some(&access))
            .await?;
        check(retried).await
    }

    async fn refresh_access(&self, refresh: &str) -> Result<String, ApiError> {
        let req = body(&RefreshRequest {
            refresh: refresh.to_string(),
        })?;
        let outcome = match self
            .dispatch(Method::POST, "auth/token/refresh/", &[], Some(&req), None)
            .await
        {
            Ok(response) => match check(response).await {
                Ok(response) => response
                    .json::<AccessToken>()
                    .await
                    .map_err(|e| ApiError::Decode(e.to_string())),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(token) => {
                self.storage.store_access_token(&token.access)?;
                info!("access token refreshed");
                Ok(token.access)
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed, clearing session");
                if let Err(e) = self.storage.clear_tokens() {
                    warn!(error = %e, "failed to clear tokens");
                }
                // nobody listening yet is fine
                let _ = self.expired.send(());
                Err(ApiError::AuthExpired)
            }
        }
    }

    async fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
        auth: Auth,
    ) -> Result<T, ApiError> {
        let response = self.send(method, path, query, body, auth).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Catalog reads consumed by the application data store.
#[async_trait]
pub trait CatalogApi: Send + Sync + 'static {
    async fn videos(&self) -> Result<Vec<Video>, ApiError>;
    async fn unlocked_videos(&self) -> Result<Vec<Video>, ApiError>;
    async fn progress(&self) -> Result<Progress, ApiError>;
}

/// Attempt-scoped operations consumed by the quiz controller.
#[async_trait]
pub trait QuizApi: Send + Sync + 'static {
    async fn video(&self, id: VideoId) -> Result<Video, ApiError>;
    async fn can_attempt(&self, id: VideoId) -> Result<Eligibility, ApiError>;
    async fn questions(&self, video: VideoId) -> Result<Vec<Question>, ApiError>;
    async fn start_attempt(&self, video: VideoId) -> Result<QuizAttempt, ApiError>;
    async fn submit_answer(
        &self,
        attempt: AttemptId,
        question: QuestionId,
        answer: AnswerId,
    ) -> Result<(), ApiError>;
    async fn user_answers(&self, attempt: AttemptId) -> Result<Vec<UserAnswer>, ApiError>;
    async fn update_timer(&self, attempt: AttemptId, remaining: u32) -> Result<(), ApiError>;
    async fn finish_attempt(&self, attempt: AttemptId) -> Result<QuizResult, ApiError>;
}

#[async_trait]
impl CatalogApi for ApiClient {
    async fn videos(&self) -> Result<Vec<Video>, ApiError> {
        self.json(Method::GET, "videos/videos/", &[], None, Auth::Bearer)
            .await
    }

    async fn unlocked_videos(&self) -> Result<Vec<Video>, ApiError> {
        self.json(Method::GET, "videos/videos/unlocked/", &[], None, Auth::Bearer)
            .await
    }

    async fn progress(&self) -> Result<Progress, ApiError> {
        self.json(Method::GET, "auth/progress/my_progress/", &[], None, Auth::Bearer)
            .await
    }
}

#[async_trait]
impl QuizApi for ApiClient {
    async fn video(&self, id: VideoId) -> Result<Video, ApiError> {
        let path = format!("videos/videos/{id}/");
        self.json(Method::GET, &path, &[], None, Auth::Bearer).await
    }

    async fn can_attempt(&self, id: VideoId) -> Result<Eligibility, ApiError> {
        let path = format!("videos/videos/{id}/can_attempt/");
        self.json(Method::GET, &path, &[], None, Auth::Bearer).await
    }

    async fn questions(&self, video: VideoId) -> Result<Vec<Question>, ApiError> {
        let query = [("video_id", video.to_string())];
        self.json(Method::GET, "quizzes/questions/by_video/", &query, None, Auth::Bearer)
            .await
    }

    async fn start_attempt(&self, video: VideoId) -> Result<QuizAttempt, ApiError> {
        let req = body(&StartAttemptReq { video_id: video })?;
        self.json(Method::POST, "quizzes/attempts/start/", &[], Some(req), Auth::Bearer)
            .await
    }

    async fn submit_answer(
        &self,
        attempt: AttemptId,
        question: QuestionId,
        answer: AnswerId,
    ) -> Result<(), ApiError> {
        let path = format!("quizzes/attempts/{attempt}/submit_answer/");
        let req = body(&SubmitAnswerReq {
            question_id: question,
            answer_id: answer,
        })?;
        self.send(Method::POST, &path, &[], Some(req), Auth::Bearer)
            .await
            .map(drop)
    }

    async fn user_answers(&self, attempt: AttemptId) -> Result<Vec<UserAnswer>, ApiError> {
        let path = format!("quizzes/attempts/{attempt}/user_answers/");
        self.json(Method::GET, &path, &[], None, Auth::Bearer).await
    }

    async fn update_timer(&self, attempt: AttemptId, remaining: u32) -> Result<(), ApiError> {
        let path = format!("quizzes/attempts/{attempt}/update_timer/");
        let req = body(&TimerUpdateReq {
            time_remaining: remaining,
        })?;
        self.send(Method::PUT, &path, &[], Some(req), Auth::Bearer)
            .await
            .map(drop)
    }

    async fn finish_attempt(&self, attempt: AttemptId) -> Result<QuizResult, ApiError> {
        let path = format!("quizzes/attempts/{attempt}/finish/");
        self.json(Method::POST, &path, &[], None, Auth::Bearer).await
    }
}

// --- helpers ---

fn body<T: Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
    Err(ApiError::Status { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, storage: LocalStorage) -> ApiClient {
        let config = ClientConfig {
            api_url: format!("{}/api/", server.uri()),
            ..ClientConfig::default()
        };
        ApiClient::new(&config, storage).unwrap()
    }

    fn with_tokens(access: &str, refresh: Option<&str>) -> LocalStorage {
        let storage = LocalStorage::in_memory();
        storage.store_access_token(access).unwrap();
        if let Some(r) = refresh {
            storage.set(crate::storage::REFRESH_TOKEN, r).unwrap();
        }
        storage
    }

    fn video_json(id: i64) -> serde_json::Value {
        json!({
            "id": id,
            "title": format!("Video {id}"),
            "description": "",
            "sequence_number": id,
            "time_limit": 10,
            "passing_percentage": 70,
            "is_active": true
        })
    }

    #[tokio::test]
    async fn attaches_bearer_and_cache_buster() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/videos/videos/"))
            .and(header("authorization", "Bearer acc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([video_json(1)])))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, with_tokens("acc", None));
        let videos = api.videos().await.unwrap();
        assert_eq!(videos.len(), 1);

        let received = server.received_requests().await.unwrap();
        assert!(received[0].url.query_pairs().any(|(k, _)| k == "_t"));
    }

    #[tokio::test]
    async fn question_query_keeps_video_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/quizzes/questions/by_video/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let api = client(&server, with_tokens("acc", None));
        api.questions(7).await.unwrap();

        let received = server.received_requests().await.unwrap();
        let pairs: Vec<(String, String)> = received[0]
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("video_id".to_string(), "7".to_string())));
        assert!(pairs.iter().any(|(k, _)| k == "_t"));
    }

    #[tokio::test]
    async fn refreshes_once_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/users/me/"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "expired"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/token/refresh/"))
            .and(body_json(json!({"refresh": "ref"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "fresh"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/auth/users/me/"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 1, "username": "ada"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let storage = with_tokens("stale", Some("ref"));
        let api = client(&server, storage.clone());
        let user = api.current_user().await.unwrap();
        assert_eq!(user.username, "ada");
        assert_eq!(storage.access_token().unwrap().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn failed_refresh_clears_tokens_and_reports_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/progress/my_progress/"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/token/refresh/"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "bad"})))
            .expect(1)
            .mount(&server)
            .await;

        let storage = with_tokens("stale", Some("ref"));
        let api = client(&server, storage.clone());
        let mut expired = api.session_expired();
        let err = api.progress().await.unwrap_err();
        assert!(matches!(err, ApiError::AuthExpired));
        assert!(err.is_auth_failure());
        assert!(!storage.has_access_token());
        assert_eq!(storage.refresh_token().unwrap(), None);
        assert!(expired.try_recv().is_ok());
    }

    #[tokio::test]
    async fn second_unauthorized_is_not_refreshed_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/videos/videos/unlocked/"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/token/refresh/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "fresh"})))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, with_tokens("stale", Some("ref")));
        let mut expired = api.session_expired();
        let err = api.unlocked_videos().await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert!(expired.try_recv().is_err(), "the refresh itself worked");
    }

    #[tokio::test]
    async fn unauthorized_without_refresh_token_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/videos/videos/3/can_attempt/"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "no creds"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/token/refresh/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "x"})))
            .expect(0)
            .mount(&server)
            .await;

        let api = client(&server, with_tokens("stale", None));
        let err = api.can_attempt(3).await.unwrap_err();
        assert_eq!(err.user_message().as_deref(), Some("no creds"));
    }

    #[tokio::test]
    async fn other_failures_propagate_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/quizzes/attempts/9/finish/"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, with_tokens("acc", Some("ref")));
        let err = api.finish_attempt(9).await.unwrap_err();
        match err {
            ApiError::Status { status, body } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, json!("boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_answer_posts_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/quizzes/attempts/5/submit_answer/"))
            .and(body_json(json!({"question_id": 11, "answer_id": 42})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"detail": "Answer submitted successfully."})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, with_tokens("acc", None));
        api.submit_answer(5, 11, 42).await.unwrap();
    }
}
