#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use serde_json::json;

use videoquiz_client::api::QuizApi;
use videoquiz_client::error::ApiError;
use videoquiz_client::models::*;
use videoquiz_client::quiz::{QuizContext, QuizController};
use videoquiz_client::routes::{Navigator, Route};
use videoquiz_client::signals::SignalBus;
use videoquiz_client::storage::LocalStorage;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Start,
    Submit(QuestionId, AnswerId),
    Timer(u32),
    Finish(AttemptId),
}

/// In-memory backend that keeps the server's view of one attempt.
pub struct Backend {
    pub eligibility: Mutex<serde_json::Value>,
    pub questions: Vec<Question>,
    pub time_remaining: u32,
    pub answer_delays: Mutex<HashMap<(QuestionId, AnswerId), u64>>,
    pub failing_answers: Mutex<Vec<QuestionId>>,
    server_answers: Mutex<HashMap<QuestionId, AnswerId>>,
    calls: Mutex<Vec<Call>>,
}

impl Backend {
    pub fn new(questions: i64, time_remaining: u32) -> Self {
        Self {
            eligibility: Mutex::new(json!({
                "can_attempt": true, "status": "start", "attempts_used": 0, "attempts_left": 2
            })),
            questions: (1..=questions).map(question).collect(),
            time_remaining,
            answer_delays: Mutex::new(HashMap::new()),
            failing_answers: Mutex::new(Vec::new()),
            server_answers: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_eligibility(&self, value: serde_json::Value) {
        *self.eligibility.lock().unwrap() = value;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn server_answer(&self, question: QuestionId) -> Option<AnswerId> {
        self.server_answers.lock().unwrap().get(&question).copied()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

pub fn question(id: i64) -> Question {
    Question {
        id,
        question_text: format!("Question {id}"),
        sequence_number: id as i32,
        answers: (1..=4)
            .map(|n| AnswerOption {
                id: id * 10 + n,
                answer_text: format!("Option {n}"),
                sequence_number: n as i32,
            })
            .collect(),
    }
}

#[async_trait]
impl QuizApi for Backend {
    async fn video(&self, id: VideoId) -> Result<Video, ApiError> {
        Ok(serde_json::from_value(json!({
            "id": id, "title": "Handling chemicals", "sequence_number": 2, "time_limit": 5
        }))
        .unwrap())
    }

    async fn can_attempt(&self, _id: VideoId) -> Result<Eligibility, ApiError> {
        Ok(serde_json::from_value(self.eligibility.lock().unwrap().clone()).unwrap())
    }

    async fn questions(&self, _video: VideoId) -> Result<Vec<Question>, ApiError> {
        Ok(self.questions.clone())
    }

    async fn start_attempt(&self, video: VideoId) -> Result<QuizAttempt, ApiError> {
        self.record(Call::Start);
        Ok(serde_json::from_value(json!({
            "id": 500, "video": video, "attempt_number": 1,
            "time_remaining": self.time_remaining, "status": "in_progress"
        }))
        .unwrap())
    }

    async fn submit_answer(
        &self,
        _attempt: AttemptId,
        question: QuestionId,
        answer: AnswerId,
    ) -> Result<(), ApiError> {
        self.record(Call::Submit(question, answer));
        let delay = self.answer_delays.lock().unwrap().get(&(question, answer)).copied();
        if let Some(ms) = delay {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.failing_answers.lock().unwrap().contains(&question) {
            return Err(ApiError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: json!({}),
            });
        }
        self.server_answers.lock().unwrap().insert(question, answer);
        Ok(())
    }

    async fn user_answers(&self, _attempt: AttemptId) -> Result<Vec<UserAnswer>, ApiError> {
        let answers = self.server_answers.lock().unwrap();
        Ok(answers
            .iter()
            .map(|(&question, &answer)| UserAnswer {
                id: None,
                question,
                selected_answer: Some(answer),
            })
            .collect())
    }

    async fn update_timer(&self, _attempt: AttemptId, remaining: u32) -> Result<(), ApiError> {
        self.record(Call::Timer(remaining));
        Ok(())
    }

    async fn finish_attempt(&self, attempt: AttemptId) -> Result<QuizResult, ApiError> {
        self.record(Call::Finish(attempt));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let total = self.questions.len() as u32;
        let correct = self.server_answers.lock().unwrap().len() as u32;
        Ok(QuizResult {
            id: Some(attempt),
            video: Some(2),
            percentage: f64::from(correct) / f64::from(total.max(1)) * 100.0,
            is_passed: Some(correct * 100 >= total * 70),
            total_questions: total,
            correct_answers: correct,
            questions_attempted: correct,
            attempt_number: 1,
        })
    }
}

pub struct Tab {
    pub quiz: QuizController<Backend>,
    pub nav: Navigator,
    pub bus: SignalBus,
    pub storage: LocalStorage,
}

pub fn open_quiz(backend: &Arc<Backend>, storage: LocalStorage) -> Tab {
    let nav = Navigator::new(Route::Quiz { video_id: 2 });
    let bus = SignalBus::new();
    let quiz = QuizController::new(
        backend.clone(),
        2,
        QuizContext {
            storage: storage.clone(),
            bus: bus.clone(),
            nav: nav.clone(),
            sync_every: 10,
        },
    );
    Tab {
        quiz,
        nav,
        bus,
        storage,
    }
}
