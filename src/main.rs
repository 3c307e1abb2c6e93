use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use videoquiz_client::api::{ApiClient, QuizApi};
use videoquiz_client::app_state::{AppData, AppDataStore};
use videoquiz_client::auth::{AuthState, AuthStore};
use videoquiz_client::certificates::Certificates;
use videoquiz_client::config::ClientConfig;
use videoquiz_client::countdown::TimeBand;
use videoquiz_client::error::ApiError;
use videoquiz_client::models::{resolve_media, AttemptId, Credentials, ProfileUpdate, Video, VideoId};
use videoquiz_client::quiz::{QuestionMarker, QuizContext, QuizController, QuizPhase, QuizSession, SubmitReason};
use videoquiz_client::routes::{Navigator, Route};
use videoquiz_client::signals::SignalBus;
use videoquiz_client::storage::LocalStorage;
use videoquiz_client::views::{
    format_percentage, video_status, DashboardView, ResultState, ResultView, VideoCard,
};

#[derive(Parser)]
#[command(name = "videoquiz")]
#[command(about = "Watch lesson videos and take their timed quizzes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and keep the session for later commands
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "VIDEOQUIZ_PASSWORD")]
        password: String,
    },
    Logout,
    /// Progress overview and the video list
    Dashboard {
        /// Keep running and reprint whenever the data refreshes
        #[arg(long)]
        watch: bool,
    },
    /// Watch a video and take its quiz
    Quiz { video_id: VideoId },
    Result { attempt_id: AttemptId },
    /// Past quiz attempts
    History,
    Certificates {
        #[command(subcommand)]
        action: Option<CertificateAction>,
    },
    /// Show or update the profile
    Profile {
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Resolve a media path or URL the way the player would
    VideoTest { source: String },
}

#[derive(Subcommand)]
enum CertificateAction {
    Generate,
    Download {
        id: i64,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

impl Command {
    fn route(&self) -> Route {
        match self {
            Command::Login { .. } | Command::Logout => Route::Login,
            Command::Dashboard { .. } | Command::History => Route::Dashboard,
            Command::Quiz { video_id } => Route::Quiz {
                video_id: *video_id,
            },
            Command::Result { attempt_id } => Route::QuizResult {
                attempt_id: *attempt_id,
            },
            Command::Certificates { .. } => Route::Certificates,
            Command::Profile { .. } => Route::Profile,
            Command::VideoTest { .. } => Route::VideoTest,
        }
    }
}

struct App {
    config: ClientConfig,
    storage: LocalStorage,
    api: ApiClient,
    auth: AuthStore,
    bus: SignalBus,
    nav: Navigator,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "videoquiz_client=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env();
    let storage = LocalStorage::open(&config.storage_dir)?;
    let api = ApiClient::new(&config, storage.clone())?;
    let auth = AuthStore::new(api.clone());
    let session = auth.start().await;

    let target = cli.command.route();
    let landed = target.clone().guard(&session);
    let app = App {
        config,
        storage,
        api,
        auth,
        bus: SignalBus::new(),
        nav: Navigator::new(landed.clone()),
    };
    let _expiry = app.auth.watch_expiry(app.nav.clone());

    match cli.command {
        Command::Logout => app.auth.logout().await,
        Command::Login { username, password } => {
            if let AuthState::Authenticated(user) = &session {
                println!("Already logged in as {}.", user.display_name());
                return Ok(());
            }
            let user = app
                .auth
                .login(&Credentials { username, password })
                .await
                .map_err(anyhow::Error::msg)?;
            println!("Welcome back, {}!", user.display_name());
        }
        Command::VideoTest { source } => video_test(&app, &source),
        command => {
            if landed == Route::Login {
                if let Some(message) = session.error() {
                    eprintln!("Session could not be restored: {message}");
                }
                bail!("not logged in; run `videoquiz login` first");
            }
            if let Err(e) = run_protected(&app, command).await {
                let expired = e
                    .downcast_ref::<ApiError>()
                    .is_some_and(ApiError::is_auth_failure);
                if expired || !app.auth.current().is_authenticated() {
                    bail!("your session has expired; run `videoquiz login` again");
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

async fn run_protected(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Dashboard { watch } => dashboard(app, watch).await,
        Command::Quiz { video_id } => quiz(app, video_id).await,
        Command::Result { attempt_id } => {
            let mut view = ResultView::new(app.api.clone(), attempt_id);
            view.load().await;
            print_result(&view);
            Ok(())
        }
        Command::History => {
            let attempts = app.api.attempts().await?;
            if attempts.is_empty() {
                println!("No attempts yet.");
            }
            for a in &attempts {
                println!(
                    "#{:<5} video {:<4} attempt {} {:?} {}%",
                    a.id,
                    a.video,
                    a.attempt_number,
                    a.status,
                    format_percentage(a.percentage)
                );
            }
            Ok(())
        }
        Command::Certificates { action } => certificates(app, action).await,
        Command::Profile {
            first_name,
            last_name,
            email,
        } => {
            let update = ProfileUpdate {
                first_name,
                last_name,
                email,
            };
            let user = if update.is_empty() {
                app.auth.current().user().cloned()
            } else {
                Some(app.auth.update_profile(&update).await?)
            };
            if let Some(user) = user {
                println!("{} ({})", user.display_name(), user.username);
                println!("email: {}", user.email.as_deref().unwrap_or("-"));
            }
            Ok(())
        }
        Command::Login { .. } | Command::Logout | Command::VideoTest { .. } => Ok(()),
    }
}

fn video_test(app: &App, source: &str) {
    let resolved = resolve_media(source, &app.config.origin());
    let kind = if Video::is_external_embed(&resolved) {
        "external embed"
    } else {
        "direct media"
    };
    println!("{resolved} ({kind})");
}

async fn dashboard(app: &App, watch: bool) -> Result<()> {
    let store = Arc::new(AppDataStore::new(Arc::new(app.api.clone()), app.config.refresh));
    if !watch {
        store.refresh().await;
        print_dashboard(app, &store.snapshot()).await;
        return Ok(());
    }

    let mut rx = store.subscribe();
    let mut auth = app.auth.subscribe();
    // quiz runs in another process write the completion marker to disk
    let dir_watch = app.storage.spawn_dir_watch(app.config.storage_poll);
    let _sync = store
        .clone()
        .spawn_sync(&app.bus, &app.storage, app.nav.subscribe());
    loop {
        tokio::select! {
            changed = auth.changed() => {
                let signed_in = changed.is_ok() && auth.borrow_and_update().is_authenticated();
                if !signed_in {
                    break;
                }
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let data = rx.borrow_and_update().clone();
                if !data.loading {
                    print_dashboard(app, &data).await;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    if let Some(task) = dir_watch {
        task.abort();
    }
    if !app.auth.current().is_authenticated() {
        bail!("your session has expired; run `videoquiz login` again");
    }
    Ok(())
}

async fn print_dashboard(app: &App, data: &AppData) {
    let view = DashboardView::from_data(data);
    if let Some(user) = app.auth.current().user() {
        println!("Welcome back, {}!", user.username);
    }
    if let Some(error) = &view.error {
        println!("! {error}");
    }
    println!(
        "{}% complete ({} of {} passed, {} failed, {} remaining, {} retries)",
        view.completion, view.passed, view.total, view.failed, view.remaining, view.retries
    );
    if view.certificate_ready {
        println!("All videos passed. A certificate can be generated.");
    }
    let attempts = app.api.attempts().await.unwrap_or_default();
    for video in &data.videos {
        let eligibility = if data.is_unlocked(video.id) {
            app.api.can_attempt(video.id).await.ok()
        } else {
            None
        };
        let card = VideoCard::new(video, data, eligibility.as_ref());
        println!(
            "{:>3}. {:<40} {:>3} min  attempts {:<4} [{}{}] {:?}",
            card.sequence_number,
            card.title,
            card.time_limit,
            card.attempts,
            card.label,
            if card.enabled { "" } else { ", disabled" },
            video_status(video.id, &attempts),
        );
    }
    if let Some(at) = view.last_updated {
        println!("Last updated {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
}

async fn certificates(app: &App, action: Option<CertificateAction>) -> Result<()> {
    let mut certs = Certificates::load(app.api.clone()).await?;
    match action {
        None => {
            let e = certs.eligibility;
            println!("{} of {} videos passed ({}%)", e.passed, e.total, e.percent());
            for c in &certs.issued {
                println!(
                    "#{} {} issued {}",
                    c.id,
                    c.unique_id,
                    c.issue_date.format("%Y-%m-%d")
                );
            }
        }
        Some(CertificateAction::Generate) => {
            let c = certs.generate().await?;
            println!("Certificate #{} generated ({})", c.id, c.unique_id);
        }
        Some(CertificateAction::Download { id, out }) => {
            let path = certs.download(id, &out).await?;
            println!("Saved {}", path.display());
        }
    }
    Ok(())
}

fn print_result(view: &ResultView) {
    match &view.state {
        ResultState::Loading => println!("Loading quiz results..."),
        ResultState::Error(message) => println!("! {message}"),
        ResultState::Loaded(_) => {
            let Some(s) = view.summary() else {
                return;
            };
            if s.passed {
                println!("Congratulations! You passed the quiz.");
            } else {
                println!("Sorry, you did not pass the quiz.");
            }
            println!(
                "{}% ({} of {} correct, pass mark {}%), attempt {}, {} attempt(s) left",
                s.percentage,
                s.correct,
                s.total,
                view.passing_percentage,
                s.attempt_number,
                s.attempts_remaining
            );
        }
    }
}

async fn quiz(app: &App, video_id: VideoId) -> Result<()> {
    let quiz = QuizController::new(
        Arc::new(app.api.clone()),
        video_id,
        QuizContext {
            storage: app.storage.clone(),
            bus: app.bus.clone(),
            nav: app.nav.clone(),
            sync_every: app.config.timer_sync_every,
        },
    );
    if let Err(e) = quiz.load().await {
        println!("! {e}");
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if quiz.snapshot().phase == QuizPhase::Watching {
        if let Some(video) = quiz.snapshot().video {
            println!("{}\n{}", video.title, video.description);
            for source in video.media_sources(&app.config.origin()) {
                println!("  {source}");
            }
            println!("  {}", app.api.stream_url(video_id)?);
            println!("You will have {} minutes to complete the quiz.", video.time_limit);
        }
        println!("Press enter once the video has been watched.");
        loop {
            if lines.next_line().await?.is_none() {
                return Ok(());
            }
            match quiz.mark_watched().await {
                Ok(()) => break,
                Err(e) => {
                    let s = quiz.snapshot();
                    println!("! {}", s.notice.unwrap_or_else(|| e.to_string()));
                    if s.phase.is_terminal() {
                        return Ok(());
                    }
                }
            }
        }
    }

    let outcome = answer_loop(&quiz, &mut lines).await;
    quiz.close();
    if let Some(attempt_id) = outcome? {
        let mut view = ResultView::new(app.api.clone(), attempt_id);
        view.load().await;
        print_result(&view);
    }
    Ok(())
}

/// Returns the attempt id once the quiz has been submitted.
async fn answer_loop<A: QuizApi>(
    quiz: &QuizController<A>,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<Option<AttemptId>> {
    print_help();
    render(&quiz.snapshot());
    let mut rx = quiz.subscribe();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(None);
                };
                let mut words = line.split_whitespace();
                match (words.next(), words.next()) {
                    (Some("n"), _) => { quiz.next(); }
                    (Some("p"), _) => { quiz.previous(); }
                    (Some("g"), Some(n)) => {
                        let index = n.parse::<usize>().unwrap_or(0).saturating_sub(1);
                        if let Err(e) = quiz.go_to(index) {
                            println!("! {e}");
                        }
                    }
                    (Some("s"), _) => match quiz.submit(SubmitReason::Manual).await {
                        Ok(_) => return Ok(quiz.snapshot().attempt_id),
                        Err(e) => println!("! {}", quiz.snapshot().notice.unwrap_or_else(|| e.to_string())),
                    },
                    (Some("q"), _) => return Ok(None),
                    (Some(choice), _) => match choice.parse::<usize>() {
                        Ok(n) if n > 0 => pick(quiz, n - 1),
                        _ => print_help(),
                    },
                    (None, _) => {}
                }
                render(&quiz.snapshot());
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(None);
                }
                let phase = rx.borrow_and_update().phase.clone();
                if let QuizPhase::Completed { attempt_id } = phase {
                    println!("Time is up. Your answers were submitted.");
                    return Ok(Some(attempt_id));
                }
            }
        }
    }
}

fn pick<A: QuizApi>(quiz: &QuizController<A>, position: usize) {
    let session = quiz.snapshot();
    let Some(question) = session.current_question() else {
        return;
    };
    let Some(answer) = question.answers.get(position) else {
        println!("! no answer {}", position + 1);
        return;
    };
    if let Err(e) = quiz.select_answer(question.id, answer.id) {
        println!("! {e}");
    }
}

fn print_help() {
    println!("1-9 pick an answer, n/p next/previous, g N go to question, s submit, q quit");
}

fn render(session: &QuizSession) {
    let Some(question) = session.current_question() else {
        return;
    };
    let markers: String = (0..session.questions.len())
        .map(|i| match session.marker(i) {
            QuestionMarker::Current => '>',
            QuestionMarker::Answered => '*',
            QuestionMarker::Visited => 'o',
            QuestionMarker::Unvisited => '.',
        })
        .collect();
    if let Some(countdown) = &session.countdown {
        let flag = match countdown.band() {
            TimeBand::Normal => "",
            TimeBand::Low => " (running low)",
            TimeBand::Critical => " (hurry!)",
        };
        println!("[{markers}] {} answered, {countdown} left{flag}", session.answered_count());
    }
    println!(
        "Question {} of {}: {}",
        session.current_index() + 1,
        session.questions.len(),
        question.question_text
    );
    let selected = session.selected(question.id);
    for (i, answer) in question.answers.iter().enumerate() {
        let mark = if selected == Some(answer.id) { 'x' } else { ' ' };
        println!("  [{mark}] {}. {}", i + 1, answer.answer_text);
    }
    if session.can_submit() {
        println!("Ready to submit (s).");
    }
    if let Some(notice) = &session.notice {
        println!("! {notice}");
    }
}
