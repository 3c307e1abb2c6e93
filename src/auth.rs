use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::error::ApiError;
use crate::models::{Credentials, ProfileUpdate, User};
use crate::routes::{Navigator, Route};

pub const LOGIN_FALLBACK: &str = "Login failed. Please check your credentials.";

#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    Unauthenticated,
    Loading,
    Authenticated(User),
    Error(String),
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated(_))
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, AuthState::Loading)
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            AuthState::Authenticated(u) => Some(u),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            AuthState::Error(m) => Some(m),
            _ => None,
        }
    }
}

/// Current identity. One per running client, created at start-up.
pub struct AuthStore {
    api: ApiClient,
    state: Arc<watch::Sender<AuthState>>,
}

impl AuthStore {
    pub fn new(api: ApiClient) -> Self {
        let (state, _) = watch::channel(AuthState::Loading);
        Self {
            api,
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Resolve the session from persisted tokens.
    pub async fn start(&self) -> AuthState {
        if !self.api.storage().has_access_token() {
            self.state.send_replace(AuthState::Unauthenticated);
            return self.current();
        }
        self.state.send_replace(AuthState::Loading);
        match self.api.current_user().await {
            Ok(user) => {
                info!(user = %user.username, "session restored");
                self.state.send_replace(AuthState::Authenticated(user));
            }
            Err(e) => {
                warn!(error = %e, "could not restore session");
                self.clear_tokens();
                self.state.send_replace(AuthState::Error(e.to_string()));
            }
        }
        self.current()
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<User, String> {
        self.state.send_replace(AuthState::Loading);
        match self.try_login(credentials).await {
            Ok(user) => {
                info!(user = %user.username, "logged in");
                self.state.send_replace(AuthState::Authenticated(user.clone()));
                Ok(user)
            }
            Err(e) => {
                let message = e.user_message().unwrap_or_else(|| LOGIN_FALLBACK.to_string());
                warn!(error = %e, %message, "login failed");
                self.state.send_replace(AuthState::Error(message.clone()));
                Err(message)
            }
        }
    }

    async fn try_login(&self, credentials: &Credentials) -> Result<User, ApiError> {
        let tokens = self.api.obtain_tokens(credentials).await?;
        self.api.storage().store_tokens(&tokens)?;
        self.api.current_user().await
    }

    /// Best-effort remote invalidation; local tokens are always dropped.
    pub async fn logout(&self) {
        if let Err(e) = self.api.logout().await {
            warn!(error = %e, "logout request failed");
        }
        self.clear_tokens();
        self.state.send_replace(AuthState::Unauthenticated);
        info!("logged out");
    }

    /// Persist profile changes and fold them into the current user.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<User, ApiError> {
        let saved = self.api.update_profile(update).await?;
        self.state.send_modify(|state| match state {
            AuthState::Authenticated(user) => {
                user.merge(update);
                if saved.id == user.id {
                    user.profile_picture = saved.profile_picture.clone();
                }
            }
            other => *other = AuthState::Authenticated(saved.clone()),
        });
        Ok(self.current().user().cloned().unwrap_or(saved))
    }

    /// Drop to `Unauthenticated` whenever the client gives up on refreshing
    /// the session, and send the user to login if they were on a protected
    /// route.
    pub fn watch_expiry(&self, nav: Navigator) -> JoinHandle<()> {
        let mut expired = self.api.session_expired();
        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                match expired.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        let was_signed_in = state.send_if_modified(|s| {
                            let signed_in = s.is_authenticated() || s.is_loading();
                            if signed_in {
                                *s = AuthState::Unauthenticated;
                            }
                            signed_in
                        });
                        if was_signed_in {
                            warn!("session expired");
                        }
                        if nav.current().is_protected() {
                            nav.navigate(Route::Login);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn clear_tokens(&self) {
        if let Err(e) = self.api.storage().clear_tokens() {
            warn!(error = %e, "failed to clear tokens");
        }
    }
}
