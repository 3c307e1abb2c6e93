use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnError, DisplayFromStr, PickFirst};
use uuid::Uuid;

pub type UserId = i64;
pub type VideoId = i64;
pub type QuestionId = i64;
pub type AnswerId = i64;
pub type AttemptId = i64;
pub type CertificateId = i64;

// characters escaped in media paths (space and friends, keeps '/')
const PATH_SEGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'#').add(b'<').add(b'>').add(b'?');

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

impl User {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }

    pub fn merge(&mut self, update: &ProfileUpdate) {
        if let Some(v) = &update.first_name {
            self.first_name = v.clone();
        }
        if let Some(v) = &update.last_name {
            self.last_name = v.clone();
        }
        if let Some(v) = &update.email {
            self.email = Some(v.clone());
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none() && self.last_name.is_none() && self.email.is_none()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AccessToken {
    pub access: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Video {
    pub id: VideoId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub sequence_number: i32,
    /// Quiz time limit in minutes.
    #[serde(default)]
    pub time_limit: u32,
    #[serde(default = "default_passing_percentage")]
    pub passing_percentage: u32,
    #[serde(default)]
    pub video_file: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

pub const DEFAULT_PASSING_PERCENTAGE: u32 = 70;

fn default_passing_percentage() -> u32 {
    DEFAULT_PASSING_PERCENTAGE
}

fn default_true() -> bool {
    true
}

impl Video {
    /// Playable sources in preference order: uploaded file, then external URL.
    /// Relative file paths resolve against `origin` (scheme + host of the API).
    pub fn media_sources(&self, origin: &str) -> Vec<String> {
        let mut out = Vec::new();
        let file = self
            .video_file
            .as_deref()
            .filter(|f| !f.is_empty())
            .map(|f| resolve_media(f, origin));
        if let Some(f) = &file {
            out.push(f.clone());
        }
        if let Some(url) = self.video_url.as_deref().filter(|u| !u.is_empty()) {
            if file.as_deref() != Some(url) {
                out.push(url.to_string());
            }
        }
        out
    }

    pub fn is_external_embed(source: &str) -> bool {
        source.contains("youtube.com") || source.contains("youtu.be")
    }
}

pub fn resolve_media(path: &str, origin: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let encoded = utf8_percent_encode(path, PATH_SEGMENT).to_string();
    let origin = origin.trim_end_matches('/');
    if encoded.starts_with('/') {
        format!("{origin}{encoded}")
    } else if encoded.starts_with("media/") {
        format!("{origin}/{encoded}")
    } else {
        format!("{origin}/media/{encoded}")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VideoRef {
    pub id: VideoId,
    #[serde(default)]
    pub title: String,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Progress {
    #[serde(default)]
    pub videos_passed: Vec<VideoRef>,
    #[serde(default)]
    pub videos_failed: Vec<VideoRef>,
    #[serde(default)]
    pub total_retries: u32,
    /// 0-100, server computed. Arrives as a decimal string.
    #[serde_as(as = "DefaultOnError<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub overall_progress: f64,
}

impl Progress {
    pub fn has_passed(&self, video: VideoId) -> bool {
        self.videos_passed.iter().any(|v| v.id == video)
    }

    pub fn has_failed(&self, video: VideoId) -> bool {
        self.videos_failed.iter().any(|v| v.id == video)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityStatus {
    Start,
    Resume,
    Passed,
    MaxAttempts,
    #[serde(other)]
    Unknown,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Eligibility {
    pub can_attempt: bool,
    #[serde(default)]
    pub status: Option<EligibilityStatus>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub attempts_used: Option<u32>,
    #[serde(default)]
    pub attempts_left: Option<u32>,
    #[serde(default)]
    pub attempt_id: Option<AttemptId>,
    #[serde(default)]
    pub time_remaining: Option<u32>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub percentage: Option<f64>,
}

impl Eligibility {
    pub fn resume_attempt(&self) -> Option<AttemptId> {
        match (self.can_attempt, self.status) {
            (true, Some(EligibilityStatus::Resume)) => self.attempt_id,
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Completed,
    TimedOut,
    #[serde(other)]
    Unknown,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuizAttempt {
    pub id: AttemptId,
    pub video: VideoId,
    #[serde(default)]
    pub attempt_number: u32,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds left on the server-side clock.
    #[serde(default)]
    pub time_remaining: u32,
    pub status: AttemptStatus,
    #[serde(default)]
    pub score: Option<u32>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub is_passed: Option<bool>,
    #[serde(default)]
    pub user_answers: Vec<UserAnswer>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserAnswer {
    #[serde(default)]
    pub id: Option<i64>,
    pub question: QuestionId,
    #[serde(default)]
    pub selected_answer: Option<AnswerId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Question {
    pub id: QuestionId,
    pub question_text: String,
    #[serde(default)]
    pub sequence_number: i32,
    #[serde(default)]
    pub answers: Vec<AnswerOption>,
}

impl Question {
    pub fn has_answer(&self, answer: AnswerId) -> bool {
        self.answers.iter().any(|a| a.id == answer)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnswerOption {
    pub id: AnswerId,
    pub answer_text: String,
    #[serde(default)]
    pub sequence_number: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartAttemptReq {
    pub video_id: VideoId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubmitAnswerReq {
    pub question_id: QuestionId,
    pub answer_id: AnswerId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimerUpdateReq {
    pub time_remaining: u32,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuizResult {
    #[serde(default)]
    pub id: Option<AttemptId>,
    #[serde(default)]
    pub video: Option<VideoId>,
    #[serde_as(as = "DefaultOnError<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub percentage: f64,
    #[serde(default)]
    pub is_passed: Option<bool>,
    #[serde(default)]
    pub total_questions: u32,
    #[serde(default)]
    pub correct_answers: u32,
    #[serde(default)]
    pub questions_attempted: u32,
    #[serde(default)]
    pub attempt_number: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Certificate {
    pub id: CertificateId,
    pub unique_id: Uuid,
    pub issue_date: DateTime<Utc>,
    #[serde(default)]
    pub is_downloaded: bool,
}
