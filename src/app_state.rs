use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::CatalogApi;
use crate::config::RefreshPolicy;
use crate::models::{Progress, Video, VideoId};
use crate::routes::Route;
use crate::signals::{AppSignal, SignalBus};
use crate::storage::{LocalStorage, QUIZ_COMPLETED};

#[derive(Debug, Clone, PartialEq)]
pub struct AppData {
    pub videos: Vec<Video>,
    pub unlocked_videos: Vec<Video>,
    pub progress: Progress,
    pub loading: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for AppData {
    fn default() -> Self {
        Self {
            videos: Vec::new(),
            unlocked_videos: Vec::new(),
            progress: Progress::default(),
            loading: true,
            last_updated: None,
            error: None,
        }
    }
}

impl AppData {
    pub fn is_unlocked(&self, video: VideoId) -> bool {
        self.unlocked_videos.iter().any(|v| v.id == video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    Failed,
    TimedOut,
    /// Another refresh was running, or the trigger was rate limited.
    Skipped,
}

/// Held for the duration of a refresh. A trigger that cannot acquire it is
/// dropped, never queued.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AppDataStore<A> {
    api: Arc<A>,
    state: watch::Sender<AppData>,
    in_flight: AtomicBool,
    policy: RefreshPolicy,
    last_focus_refresh: Mutex<Option<Instant>>,
}

impl<A: CatalogApi> AppDataStore<A> {
    pub fn new(api: Arc<A>, policy: RefreshPolicy) -> Self {
        let (state, _) = watch::channel(AppData::default());
        Self {
            api,
            state,
            in_flight: AtomicBool::new(false),
            policy,
            last_focus_refresh: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AppData> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> AppData {
        self.state.borrow().clone()
    }

    pub async fn refresh(&self) -> RefreshOutcome {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!("refresh already in flight, dropping trigger");
            return RefreshOutcome::Skipped;
        };
        self.state.send_modify(|s| s.loading = true);

        let api = &self.api;
        let fetch = async {
            tokio::try_join!(api.videos(), api.unlocked_videos(), api.progress())
        };

        match timeout(self.policy.hard_timeout, fetch).await {
            Ok(Ok((videos, unlocked_videos, progress))) => {
                info!(videos = videos.len(), unlocked = unlocked_videos.len(), "app data refreshed");
                self.state.send_modify(|s| {
                    s.videos = videos;
                    s.unlocked_videos = unlocked_videos;
                    s.progress = progress;
                    s.loading = false;
                    s.error = None;
                    s.last_updated = Some(Utc::now());
                });
                RefreshOutcome::Refreshed
            }
            Ok(Err(e)) => {
                warn!(error = %e, "app data refresh failed");
                self.fail(format!("Failed to load data: {e}"));
                RefreshOutcome::Failed
            }
            Err(_) => {
                warn!(limit = ?self.policy.hard_timeout, "app data refresh timed out");
                self.fail("Loading data took too long. Showing defaults.".to_string());
                RefreshOutcome::TimedOut
            }
        }
    }

    fn fail(&self, message: String) {
        self.state.send_modify(|s| {
            s.progress = Progress::default();
            s.loading = false;
            s.error = Some(message);
        });
    }

    /// Focus and visibility triggers, at most one per rate-limit window.
    pub async fn refresh_on_focus(&self) -> RefreshOutcome {
        let now = Instant::now();
        {
            let mut last = self
                .last_focus_refresh
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if let Some(prev) = *last {
                if now.duration_since(prev) < self.policy.focus_rate_limit {
                    debug!("focus refresh rate limited");
                    return RefreshOutcome::Skipped;
                }
            }
            *last = Some(now);
        }
        self.refresh().await
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let store = self.clone();
        tokio::spawn(async move {
            store.refresh().await;
        });
    }

    fn spawn_focus_refresh(self: &Arc<Self>) {
        let store = self.clone();
        tokio::spawn(async move {
            store.refresh_on_focus().await;
        });
    }

    /// Start every refresh trigger: mount, data-changed signals, the
    /// cross-tab quiz marker, focus/visibility and the dashboard poll.
    pub fn spawn_sync(
        self: Arc<Self>,
        bus: &SignalBus,
        storage: &LocalStorage,
        route: watch::Receiver<Route>,
    ) -> SyncHandle {
        let mut signals = bus.subscribe();
        let mut storage_events = storage.subscribe();
        let storage = storage.clone();
        let period = self.policy.poll_interval;

        let task = tokio::spawn(async move {
            let mut poll = interval_at(Instant::now() + period, period);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut visible = true;

            self.spawn_refresh();
            loop {
                tokio::select! {
                    signal = signals.recv() => match signal {
                        Ok(AppSignal::DataChanged) => self.spawn_refresh(),
                        Ok(AppSignal::FocusGained) => self.spawn_focus_refresh(),
                        Ok(AppSignal::VisibilityChanged { visible: now_visible }) => {
                            visible = now_visible;
                            if visible {
                                self.spawn_focus_refresh();
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "signal bus lagged, refreshing");
                            self.spawn_refresh();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = storage_events.recv() => match event {
                        Some(ev) if ev.key == QUIZ_COMPLETED && ev.new_value.is_some() => {
                            info!("quiz completed in another tab");
                            if let Err(e) = storage.remove(QUIZ_COMPLETED) {
                                warn!(error = %e, "could not clear quiz marker");
                            }
                            self.spawn_refresh();
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = poll.tick() => {
                        if visible && *route.borrow() == Route::Dashboard {
                            debug!("dashboard poll");
                            self.spawn_refresh();
                        }
                    }
                }
            }
        });
        SyncHandle { task }
    }
}

/// Owns the trigger loop; dropping it tears the loop down.
pub struct SyncHandle {
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn shutdown(self) {}
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
