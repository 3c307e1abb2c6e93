use chrono::{DateTime, Utc};
use tracing::warn;

use crate::api::{ApiClient, QuizApi};
use crate::app_state::AppData;
use crate::certificates::CertificateEligibility;
use crate::config::ATTEMPT_CAP;
use crate::models::{
    AttemptId, AttemptStatus, Eligibility, EligibilityStatus, QuizAttempt, QuizResult, Video,
    VideoId, DEFAULT_PASSING_PERCENTAGE,
};
use crate::routes::{Navigator, Route};
use crate::signals::SignalBus;

pub use crate::countdown::format_clock as format_time;

/// One decimal place; missing or non-finite values show as `0.0`.
pub fn format_percentage(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{v:.1}"),
        _ => "0.0".to_string(),
    }
}

pub fn completion_percent(passed: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    (passed as f64 / total as f64 * 100.0).round() as u32
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardView {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub retries: u32,
    pub remaining: usize,
    pub completion: u32,
    pub overall_progress: f64,
    pub certificate_ready: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub loading: bool,
    pub error: Option<String>,
}

impl DashboardView {
    pub fn from_data(data: &AppData) -> Self {
        let total = data.videos.len();
        let passed = data.progress.videos_passed.len();
        let failed = data.progress.videos_failed.len();
        Self {
            total,
            passed,
            failed,
            retries: data.progress.total_retries,
            remaining: total.saturating_sub(passed + failed),
            completion: completion_percent(passed, total),
            overall_progress: data.progress.overall_progress,
            certificate_ready: CertificateEligibility::evaluate(&data.videos, &data.progress)
                .is_eligible(),
            last_updated: data.last_updated,
            loading: data.loading,
            error: data.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStatus {
    NotAttempted,
    Passed,
    InProgress,
    MaxAttempts,
    Failed,
}

pub fn video_status(video: VideoId, attempts: &[QuizAttempt]) -> VideoStatus {
    let mine: Vec<_> = attempts.iter().filter(|a| a.video == video).collect();
    if mine.is_empty() {
        VideoStatus::NotAttempted
    } else if mine.iter().any(|a| a.is_passed == Some(true)) {
        VideoStatus::Passed
    } else if mine.iter().any(|a| a.status == AttemptStatus::InProgress) {
        VideoStatus::InProgress
    } else if mine.len() >= ATTEMPT_CAP as usize {
        VideoStatus::MaxAttempts
    } else {
        VideoStatus::Failed
    }
}

/// `used/cap`, preferring the server's own numbers.
pub fn attempts_label(eligibility: Option<&Eligibility>) -> String {
    let used = eligibility.and_then(|e| e.attempts_used).unwrap_or(0);
    let cap = match eligibility.map(|e| (e.attempts_used, e.attempts_left)) {
        Some((Some(used), Some(left))) => used + left,
        _ => ATTEMPT_CAP,
    };
    format!("{used}/{cap}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoCard {
    pub video_id: VideoId,
    pub title: String,
    pub sequence_number: i32,
    pub time_limit: u32,
    pub unlocked: bool,
    pub passed: bool,
    pub failed: bool,
    pub label: &'static str,
    pub enabled: bool,
    pub attempts: String,
    pub score: Option<f64>,
}

impl VideoCard {
    pub fn new(video: &Video, data: &AppData, eligibility: Option<&Eligibility>) -> Self {
        let unlocked = data.is_unlocked(video.id);
        let status = eligibility.and_then(|e| e.status);
        let passed = data.progress.has_passed(video.id) || status == Some(EligibilityStatus::Passed);
        let failed = data.progress.has_failed(video.id);

        let (label, enabled) = if !unlocked {
            ("Locked", false)
        } else if passed {
            ("Completed", false)
        } else if failed || status == Some(EligibilityStatus::MaxAttempts) {
            ("Maximum Attempts Reached", false)
        } else if status == Some(EligibilityStatus::Resume) {
            ("Resume Quiz", true)
        } else {
            ("Start Quiz", true)
        };

        Self {
            video_id: video.id,
            title: video.title.clone(),
            sequence_number: video.sequence_number,
            time_limit: video.time_limit,
            unlocked,
            passed,
            failed,
            label,
            enabled,
            attempts: attempts_label(eligibility),
            score: eligibility.and_then(|e| e.percentage).filter(|_| passed),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultSummary {
    pub passed: bool,
    pub percentage: String,
    pub correct: u32,
    pub total: u32,
    pub attempt_number: u32,
    pub attempts_remaining: u32,
    /// Signed distance from the pass mark, in percentage points.
    pub margin: f64,
}

impl ResultSummary {
    pub fn new(result: &QuizResult, passing_percentage: u32) -> Self {
        let percentage = if result.percentage.is_finite() {
            result.percentage
        } else {
            0.0
        };
        Self {
            passed: result.is_passed.unwrap_or(false),
            percentage: format_percentage(Some(percentage)),
            correct: result.correct_answers,
            total: result.total_questions,
            attempt_number: result.attempt_number,
            attempts_remaining: ATTEMPT_CAP.saturating_sub(result.attempt_number),
            margin: percentage - f64::from(passing_percentage),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultState {
    Loading,
    Loaded(QuizResult),
    Error(String),
}

pub const RESULT_FAILED: &str = "Failed to load quiz result. Please try again later.";

pub struct ResultView {
    api: ApiClient,
    pub attempt_id: AttemptId,
    pub state: ResultState,
    /// Pass mark of the quiz's video, once the result names one.
    pub passing_percentage: u32,
}

impl ResultView {
    pub fn new(api: ApiClient, attempt_id: AttemptId) -> Self {
        Self {
            api,
            attempt_id,
            state: ResultState::Loading,
            passing_percentage: DEFAULT_PASSING_PERCENTAGE,
        }
    }

    /// Fetch (or re-fetch, for "try again") the finalized result.
    pub async fn load(&mut self) -> &ResultState {
        self.state = ResultState::Loading;
        self.state = match self.api.result(self.attempt_id).await {
            Ok(result) => {
                if let Some(video) = result.video {
                    self.passing_percentage = self.pass_mark(video).await;
                }
                ResultState::Loaded(result)
            }
            Err(e) => {
                warn!(attempt_id = self.attempt_id, error = %e, "result unavailable");
                ResultState::Error(RESULT_FAILED.to_string())
            }
        };
        &self.state
    }

    async fn pass_mark(&self, video: VideoId) -> u32 {
        match self.api.video(video).await {
            Ok(v) => v.passing_percentage,
            Err(e) => {
                warn!(video_id = video, error = %e, "pass mark unavailable, using default");
                DEFAULT_PASSING_PERCENTAGE
            }
        }
    }

    pub fn summary(&self) -> Option<ResultSummary> {
        match &self.state {
            ResultState::Loaded(r) => Some(ResultSummary::new(r, self.passing_percentage)),
            _ => None,
        }
    }

    pub fn back_to_dashboard(&self, bus: &SignalBus, nav: &Navigator) {
        bus.data_changed();
        nav.navigate(Route::Dashboard);
    }
}
