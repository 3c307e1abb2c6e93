use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use http::StatusCode;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::api::QuizApi;
use crate::countdown::{Countdown, Tick};
use crate::error::{ApiError, QuizError};
use crate::models::{
    AnswerId, AttemptId, Eligibility, Question, QuestionId, QuizResult, UserAnswer, Video, VideoId,
};
use crate::routes::{Navigator, Route};
use crate::signals::SignalBus;
use crate::storage::{LocalStorage, QUIZ_COMPLETED};

pub const SUBMIT_FAILED: &str = "Failed to submit quiz. Please try again.";
pub const LOAD_FAILED: &str = "Failed to load quiz data. Please try again later.";
const INELIGIBLE: &str = "You cannot attempt this quiz right now.";
// Used when neither the server nor the video gives a time limit.
const FALLBACK_TIME_SECS: u32 = 600;

#[derive(Debug, Clone, PartialEq)]
pub enum QuizPhase {
    Loading,
    Watching,
    Answering,
    Submitting,
    Completed { attempt_id: AttemptId },
    Error(String),
}

impl QuizPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QuizPhase::Completed { .. } | QuizPhase::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionMarker {
    Current,
    Answered,
    Visited,
    Unvisited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitReason {
    Manual,
    // The countdown reached zero. Every held answer is pushed again first.
    TimerExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Selection {
    answer: AnswerId,
    seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuizSession {
    pub video_id: VideoId,
    pub phase: QuizPhase,
    pub video: Option<Video>,
    pub eligibility: Option<Eligibility>,
    pub questions: Vec<Question>,
    pub attempt_id: Option<AttemptId>,
    pub countdown: Option<Countdown>,
    pub video_watched: bool,
    pub notice: Option<String>,
    current: usize,
    selections: HashMap<QuestionId, Selection>,
    visited: HashSet<QuestionId>,
    next_seq: u64,
}

impl QuizSession {
    pub fn new(video_id: VideoId) -> Self {
        Self {
            video_id,
            phase: QuizPhase::Loading,
            video: None,
            eligibility: None,
            questions: Vec::new(),
            attempt_id: None,
            countdown: None,
            video_watched: false,
            notice: None,
            current: 0,
            selections: HashMap::new(),
            visited: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.questions.get(self.current)
    }

    pub fn selected(&self, question: QuestionId) -> Option<AnswerId> {
        self.selections.get(&question).map(|s| s.answer)
    }

    pub fn answered_count(&self) -> usize {
        self.selections.len()
    }

    pub fn marker(&self, index: usize) -> QuestionMarker {
        let Some(q) = self.questions.get(index) else {
            return QuestionMarker::Unvisited;
        };
        if index == self.current {
            QuestionMarker::Current
        } else if self.selections.contains_key(&q.id) {
            QuestionMarker::Answered
        } else if self.visited.contains(&q.id) {
            QuestionMarker::Visited
        } else {
            QuestionMarker::Unvisited
        }
    }

    /// Submit is offered on the last question, or once every question was seen.
    pub fn can_submit(&self) -> bool {
        if self.phase != QuizPhase::Answering || self.questions.is_empty() {
            return false;
        }
        self.current + 1 == self.questions.len()
            || self.questions.iter().all(|q| self.visited.contains(&q.id))
    }

    pub fn go_to(&mut self, index: usize) -> Result<(), QuizError> {
        if self.phase != QuizPhase::Answering {
            return Err(QuizError::NotAnswering);
        }
        let id = self
            .questions
            .get(index)
            .map(|q| q.id)
            .ok_or(QuizError::NoSuchPosition(index))?;
        self.current = index;
        self.visited.insert(id);
        Ok(())
    }

    pub fn next(&mut self) -> bool {
        self.current + 1 < self.questions.len() && self.go_to(self.current + 1).is_ok()
    }

    pub fn previous(&mut self) -> bool {
        self.current > 0 && self.go_to(self.current - 1).is_ok()
    }

    pub fn select(&mut self, question: QuestionId, answer: AnswerId) -> Result<u64, QuizError> {
        if self.phase != QuizPhase::Answering {
            return Err(QuizError::NotAnswering);
        }
        let q = self
            .questions
            .iter()
            .find(|q| q.id == question)
            .ok_or(QuizError::UnknownQuestion(question))?;
        if !q.has_answer(answer) {
            return Err(QuizError::UnknownAnswer { question, answer });
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.selections.insert(question, Selection { answer, seq });
        self.visited.insert(question);
        Ok(seq)
    }

    pub fn is_latest(&self, question: QuestionId, seq: u64) -> bool {
        self.selections.get(&question).is_some_and(|s| s.seq == seq)
    }

    pub fn selections(&self) -> Vec<(QuestionId, AnswerId)> {
        self.pending().into_iter().map(|(q, a, _)| (q, a)).collect()
    }

    fn pending(&self) -> Vec<(QuestionId, AnswerId, u64)> {
        self.questions
            .iter()
            .filter_map(|q| self.selections.get(&q.id).map(|s| (q.id, s.answer, s.seq)))
            .collect()
    }

    pub fn begin_answering(
        &mut self,
        attempt_id: AttemptId,
        remaining_secs: u32,
        sync_every: u32,
        prior: &[UserAnswer],
    ) {
        self.phase = QuizPhase::Answering;
        self.attempt_id = Some(attempt_id);
        self.countdown = Some(Countdown::new(remaining_secs, sync_every));
        self.video_watched = true;
        self.notice = None;
        self.selections.clear();
        self.visited.clear();

        for ua in prior {
            let Some(answer) = ua.selected_answer else {
                continue;
            };
            let known = self
                .questions
                .iter()
                .any(|q| q.id == ua.question && q.has_answer(answer));
            if known {
                self.next_seq += 1;
                self.selections.insert(
                    ua.question,
                    Selection {
                        answer,
                        seq: self.next_seq,
                    },
                );
                self.visited.insert(ua.question);
            }
        }

        self.current = self
            .questions
            .iter()
            .position(|q| !self.selections.contains_key(&q.id))
            .unwrap_or(self.questions.len().saturating_sub(1));
        if let Some(q) = self.questions.get(self.current) {
            self.visited.insert(q.id);
        }
    }

    /// The single `Answering -> Submitting` gate.
    pub fn begin_submit(&mut self) -> Result<AttemptId, QuizError> {
        match (&self.phase, self.attempt_id) {
            (QuizPhase::Answering, Some(attempt)) => {
                self.phase = QuizPhase::Submitting;
                self.notice = None;
                Ok(attempt)
            }
            (QuizPhase::Submitting | QuizPhase::Completed { .. }, _) => {
                Err(QuizError::AlreadySubmitting)
            }
            _ => Err(QuizError::NotAnswering),
        }
    }

    pub fn submit_failed(&mut self, notice: &str) {
        if self.phase == QuizPhase::Submitting {
            self.phase = QuizPhase::Answering;
        }
        self.notice = Some(notice.to_string());
    }

    pub fn complete(&mut self, attempt_id: AttemptId) {
        self.phase = QuizPhase::Completed { attempt_id };
    }

    pub fn fail(&mut self, message: String) {
        self.phase = QuizPhase::Error(message);
    }
}

pub fn start_error_message(err: &ApiError) -> String {
    if matches!(err, ApiError::AuthExpired) {
        return "You are not authorized. Please log in again.".to_string();
    }
    match err.status() {
        Some(StatusCode::BAD_REQUEST) => err
            .user_message()
            .unwrap_or_else(|| "Bad request - check if you have available attempts.".to_string()),
        Some(StatusCode::UNAUTHORIZED) => "You are not authorized. Please log in again.".to_string(),
        Some(StatusCode::NOT_FOUND) => "Video not found.".to_string(),
        _ => "Failed to start quiz. Please try again later.".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct QuizContext {
    pub storage: LocalStorage,
    pub bus: SignalBus,
    pub nav: Navigator,
    pub sync_every: u32,
}

struct Inner<A> {
    api: Arc<A>,
    ctx: QuizContext,
    state: watch::Sender<QuizSession>,
    lanes: Mutex<HashMap<QuestionId, Arc<tokio::sync::Mutex<()>>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    timer_sync: Mutex<Option<JoinHandle<()>>>,
}

/// Drives one quiz view. Cheap to clone; clones share the session.
pub struct QuizController<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for QuizController<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, next: Option<JoinHandle<()>>) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(prev) = std::mem::replace(&mut *slot, next) {
        prev.abort();
    }
}

impl<A: QuizApi> QuizController<A> {
    pub fn new(api: Arc<A>, video_id: VideoId, ctx: QuizContext) -> Self {
        let (state, _) = watch::channel(QuizSession::new(video_id));
        Self {
            inner: Arc::new(Inner {
                api,
                ctx,
                state,
                lanes: Mutex::new(HashMap::new()),
                timer: Mutex::new(None),
                timer_sync: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<QuizSession> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> QuizSession {
        self.inner.state.borrow().clone()
    }

    fn video_id(&self) -> VideoId {
        self.inner.state.borrow().video_id
    }

    fn time_limit_secs(&self) -> u32 {
        let minutes = self
            .inner
            .state
            .borrow()
            .video
            .as_ref()
            .map_or(0, |v| v.time_limit);
        match minutes {
            0 => FALLBACK_TIME_SECS,
            m => m * 60,
        }
    }

    fn abort(&self, err: QuizError) -> QuizError {
        let message = match &err {
            QuizError::Api(e) => e.user_message().unwrap_or_else(|| LOAD_FAILED.to_string()),
            other => other.to_string(),
        };
        warn!(video_id = self.video_id(), error = %err, "quiz unavailable");
        self.inner.state.send_modify(|s| s.fail(message));
        err
    }

    pub async fn load(&self) -> Result<(), QuizError> {
        let id = self.video_id();
        self.inner.state.send_modify(|s| s.phase = QuizPhase::Loading);
        let api = &self.inner.api;

        let video = api.video(id).await.map_err(|e| self.abort(e.into()))?;
        let eligibility = api.can_attempt(id).await.map_err(|e| self.abort(e.into()))?;
        if !eligibility.can_attempt {
            let reason = eligibility
                .reason
                .clone()
                .unwrap_or_else(|| INELIGIBLE.to_string());
            self.inner.state.send_modify(|s| {
                s.video = Some(video);
                s.eligibility = Some(eligibility);
            });
            return Err(self.abort(QuizError::Ineligible(reason)));
        }

        let questions = api.questions(id).await.map_err(|e| self.abort(e.into()))?;
        if questions.is_empty() {
            return Err(self.abort(QuizError::NoQuestions(id)));
        }

        let resume = eligibility.resume_attempt();
        let time_remaining = eligibility.time_remaining;
        self.inner.state.send_modify(|s| {
            s.video = Some(video);
            s.questions = questions;
            s.eligibility = Some(eligibility);
        });

        match resume {
            Some(attempt) => self.resume(attempt, time_remaining).await,
            None => {
                info!(video_id = id, "waiting for the video to be watched");
                self.inner.state.send_modify(|s| s.phase = QuizPhase::Watching);
                Ok(())
            }
        }
    }

    async fn resume(&self, attempt: AttemptId, time_remaining: Option<u32>) -> Result<(), QuizError> {
        let prior = self
            .inner
            .api
            .user_answers(attempt)
            .await
            .map_err(|e| self.abort(e.into()))?;
        let remaining = time_remaining.unwrap_or_else(|| self.time_limit_secs());
        info!(attempt_id = attempt, answered = prior.len(), remaining, "resuming attempt");
        let sync_every = self.inner.ctx.sync_every;
        self.inner
            .state
            .send_modify(|s| s.begin_answering(attempt, remaining, sync_every, &prior));
        self.start_timer();
        Ok(())
    }

    /// The video ended, or the learner confirmed watching it. Creates the
    /// attempt after a fresh eligibility check.
    pub async fn mark_watched(&self) -> Result<(), QuizError> {
        let mut watching = false;
        self.inner.state.send_if_modified(|s| {
            watching = s.phase == QuizPhase::Watching;
            if watching {
                s.video_watched = true;
                s.notice = None;
            }
            watching
        });
        if !watching {
            return Err(QuizError::NotWatching);
        }
        self.start_quiz().await
    }

    async fn start_quiz(&self) -> Result<(), QuizError> {
        let id = self.video_id();
        let eligibility = match self.inner.api.can_attempt(id).await {
            Ok(e) => e,
            Err(e) => return Err(self.start_failed(e)),
        };
        if !eligibility.can_attempt {
            let reason = eligibility.reason.unwrap_or_else(|| INELIGIBLE.to_string());
            return Err(self.abort(QuizError::Ineligible(reason)));
        }
        if let Some(attempt) = eligibility.resume_attempt() {
            return self.resume(attempt, eligibility.time_remaining).await;
        }

        match self.inner.api.start_attempt(id).await {
            Ok(attempt) => {
                let remaining = Some(attempt.time_remaining)
                    .filter(|t| *t > 0)
                    .unwrap_or_else(|| self.time_limit_secs());
                info!(attempt_id = attempt.id, attempt_number = attempt.attempt_number, remaining, "quiz attempt started");
                let sync_every = self.inner.ctx.sync_every;
                self.inner
                    .state
                    .send_modify(|s| s.begin_answering(attempt.id, remaining, sync_every, &[]));
                self.start_timer();
                Ok(())
            }
            Err(e) => Err(self.start_failed(e)),
        }
    }

    fn start_failed(&self, err: ApiError) -> QuizError {
        let message = start_error_message(&err);
        warn!(error = %err, %message, "could not start quiz");
        self.inner.state.send_modify(|s| s.notice = Some(message));
        err.into()
    }

    pub fn go_to(&self, index: usize) -> Result<(), QuizError> {
        let mut outcome = Ok(());
        self.inner.state.send_if_modified(|s| {
            outcome = s.go_to(index);
            outcome.is_ok()
        });
        outcome
    }

    pub fn next(&self) -> bool {
        self.inner.state.send_if_modified(QuizSession::next)
    }

    pub fn previous(&self) -> bool {
        self.inner.state.send_if_modified(QuizSession::previous)
    }

    /// Reflect the pick immediately and persist it in the background. The
    /// returned handle resolves once the pick reached the server, failed, or
    /// was superseded by a newer pick for the same question.
    pub fn select_answer(
        &self,
        question: QuestionId,
        answer: AnswerId,
    ) -> Result<JoinHandle<()>, QuizError> {
        let mut picked = Err(QuizError::NotAnswering);
        self.inner.state.send_if_modified(|s| {
            picked = s
                .select(question, answer)
                .and_then(|seq| s.attempt_id.map(|a| (a, seq)).ok_or(QuizError::NotAnswering));
            picked.is_ok()
        });
        let (attempt, seq) = picked?;

        let this = self.clone();
        Ok(tokio::spawn(async move {
            if let Err(e) = this.push_answer(attempt, question, answer, seq).await {
                warn!(attempt_id = attempt, question_id = question, error = %e, "answer sync failed");
            }
        }))
    }

    fn lane(&self, question: QuestionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self
            .inner
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        lanes.entry(question).or_default().clone()
    }

    // Sends go out one at a time per question; a pick that is no longer the
    // latest by the time its turn comes is dropped.
    async fn push_answer(
        &self,
        attempt: AttemptId,
        question: QuestionId,
        answer: AnswerId,
        seq: u64,
    ) -> Result<bool, ApiError> {
        let lane = self.lane(question);
        let _turn = lane.lock().await;
        let latest = self.inner.state.borrow().is_latest(question, seq);
        if !latest {
            debug!(question_id = question, seq, "pick superseded");
            return Ok(false);
        }
        self.inner.api.submit_answer(attempt, question, answer).await?;
        Ok(true)
    }

    fn start_timer(&self) {
        let this = self.clone();
        let video_id = self.video_id();
        let mut route = self.inner.ctx.nav.subscribe();

        let task = tokio::spawn(async move {
            let already_expired = this
                .inner
                .state
                .borrow()
                .countdown
                .as_ref()
                .is_some_and(Countdown::is_expired);
            if already_expired {
                this.expire().await;
                return;
            }

            let second = Duration::from_secs(1);
            let mut ticker = interval_at(Instant::now() + second, second);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = route.changed() => {
                        let here = changed.is_ok()
                            && *route.borrow_and_update() == Route::Quiz { video_id };
                        if !here {
                            info!(video_id, "left the quiz, timer stopped");
                            break;
                        }
                        continue;
                    }
                }

                let mut step = None;
                this.inner.state.send_if_modified(|s| {
                    if s.phase != QuizPhase::Answering {
                        return false;
                    }
                    let attempt = s.attempt_id;
                    step = s.countdown.as_mut().map(|c| (attempt, c.tick()));
                    step.is_some()
                });

                match step {
                    Some((Some(attempt), Tick::Running { remaining, sync: true })) => {
                        this.sync_timer(attempt, remaining);
                    }
                    Some((_, Tick::Running { .. })) => {}
                    Some((_, Tick::Expired)) => {
                        this.expire().await;
                        break;
                    }
                    None => {
                        let done = this.inner.state.borrow().phase.is_terminal();
                        if done {
                            break;
                        }
                    }
                }
            }
            replace_task(&this.inner.timer_sync, None);
        });
        replace_task(&self.inner.timer, Some(task));
    }

    fn sync_timer(&self, attempt: AttemptId, remaining: u32) {
        let api = self.inner.api.clone();
        let task = tokio::spawn(async move {
            match api.update_timer(attempt, remaining).await {
                Ok(()) => debug!(attempt_id = attempt, remaining, "timer synced"),
                Err(e) => warn!(attempt_id = attempt, remaining, error = %e, "timer sync failed"),
            }
        });
        // only the newest remaining time matters
        replace_task(&self.inner.timer_sync, Some(task));
    }

    async fn expire(&self) {
        info!(video_id = self.video_id(), "time is up, submitting");
        if let Err(e) = self.submit(SubmitReason::TimerExpired).await {
            warn!(error = %e, "automatic submission failed");
        }
    }

    /// Finalize the attempt. Only one submission can be in progress; later
    /// calls get [`QuizError::AlreadySubmitting`] without touching the server.
    pub async fn submit(&self, reason: SubmitReason) -> Result<QuizResult, QuizError> {
        let mut began = Err(QuizError::NotAnswering);
        let mut pending = Vec::new();
        self.inner.state.send_if_modified(|s| {
            began = s.begin_submit();
            if began.is_ok() {
                pending = s.pending();
            }
            began.is_ok()
        });
        let attempt = began?;
        info!(attempt_id = attempt, ?reason, "submitting quiz");

        if reason == SubmitReason::TimerExpired {
            let sends = pending.into_iter().map(|(question, answer, seq)| async move {
                if let Err(e) = self.push_answer(attempt, question, answer, seq).await {
                    warn!(attempt_id = attempt, question_id = question, error = %e, "answer resubmit failed");
                }
            });
            join_all(sends).await;
        }

        match self.inner.api.finish_attempt(attempt).await {
            Ok(result) => {
                self.finished(attempt);
                Ok(result)
            }
            Err(e) => {
                warn!(attempt_id = attempt, error = %e, "finishing attempt failed");
                self.inner.state.send_modify(|s| s.submit_failed(SUBMIT_FAILED));
                Err(e.into())
            }
        }
    }

    fn finished(&self, attempt: AttemptId) {
        self.inner.state.send_modify(|s| s.complete(attempt));
        replace_task(&self.inner.timer_sync, None);

        let ctx = &self.inner.ctx;
        let stamp = Utc::now().timestamp_millis().to_string();
        if let Err(e) = ctx.storage.set(QUIZ_COMPLETED, &stamp) {
            warn!(error = %e, "could not write quiz marker");
        }
        ctx.bus.data_changed();
        ctx.nav.navigate(Route::QuizResult { attempt_id: attempt });
        info!(attempt_id = attempt, "quiz submitted");
    }

    pub fn close(&self) {
        replace_task(&self.inner.timer, None);
        replace_task(&self.inner.timer_sync, None);
    }
}
