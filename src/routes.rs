use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::auth::AuthState;
use crate::models::{AttemptId, VideoId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Login,
    Dashboard,
    Quiz { video_id: VideoId },
    QuizResult { attempt_id: AttemptId },
    Certificates,
    Profile,
    /// Unauthenticated manual playback check.
    VideoTest,
}

impl Route {
    pub fn is_protected(&self) -> bool {
        !matches!(self, Route::Login | Route::VideoTest)
    }

    /// Where an auth state actually lets this route land.
    pub fn guard(self, auth: &AuthState) -> Route {
        let authed = auth.is_authenticated();
        if authed && self == Route::Login {
            return Route::Dashboard;
        }
        if !authed && self.is_protected() {
            return Route::Login;
        }
        self
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Login => write!(f, "/login"),
            Route::Dashboard => write!(f, "/dashboard"),
            Route::Quiz { video_id } => write!(f, "/quiz/{video_id}"),
            Route::QuizResult { attempt_id } => write!(f, "/quiz-result/{attempt_id}"),
            Route::Certificates => write!(f, "/certificates"),
            Route::Profile => write!(f, "/profile"),
            Route::VideoTest => write!(f, "/video-test"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown route {0}")]
pub struct UnknownRoute(pub String);

impl FromStr for Route {
    type Err = UnknownRoute;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches('/');
        let parts: Vec<&str> = trimmed.split('/').filter(|p| !p.is_empty()).collect();
        let unknown = || UnknownRoute(s.to_string());
        match parts.as_slice() {
            [] | ["dashboard"] => Ok(Route::Dashboard),
            ["login"] => Ok(Route::Login),
            ["certificates"] => Ok(Route::Certificates),
            ["profile"] => Ok(Route::Profile),
            ["video-test"] => Ok(Route::VideoTest),
            ["quiz", id] => id
                .parse()
                .map(|video_id| Route::Quiz { video_id })
                .map_err(|_| unknown()),
            ["quiz-result", id] => id
                .parse()
                .map(|attempt_id| Route::QuizResult { attempt_id })
                .map_err(|_| unknown()),
            _ => Err(unknown()),
        }
    }
}

/// Current location, observable by anything that gates work on the view.
#[derive(Debug, Clone)]
pub struct Navigator {
    tx: Arc<watch::Sender<Route>>,
}

impl Navigator {
    pub fn new(initial: Route) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn navigate(&self, to: Route) {
        info!(route = %to, "navigate");
        self.tx.send_replace(to);
    }

    pub fn current(&self) -> Route {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Route> {
        self.tx.subscribe()
    }
}
