use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::TokenPair;

pub const ACCESS_TOKEN: &str = "access_token";
pub const REFRESH_TOKEN: &str = "refresh_token";
pub const QUIZ_COMPLETED: &str = "quiz_completed";

// Sender id for changes found on disk, i.e. made by another process.
const ANOTHER_PROCESS: Uuid = Uuid::nil();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
}

#[derive(Debug, Clone)]
struct Envelope {
    tab: Uuid,
    event: StorageEvent,
}

#[derive(Debug)]
enum Backend {
    Memory(Mutex<HashMap<String, String>>),
    Dir {
        root: PathBuf,
        // last values this origin wrote or announced, guarded across the disk write
        known: Mutex<HashMap<String, String>>,
    },
}

#[derive(Debug)]
struct Origin {
    backend: Backend,
    events: broadcast::Sender<Envelope>,
}

#[derive(Debug, Clone)]
pub struct LocalStorage {
    tab: Uuid,
    origin: Arc<Origin>,
}

impl LocalStorage {
    pub fn in_memory() -> Self {
        Self::with_backend(Backend::Memory(Mutex::new(HashMap::new())))
    }

    /// File-backed origin rooted at `dir`, one file per key.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir).map_err(|source| StorageError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        let known = read_dir_values(dir)?;
        Ok(Self::with_backend(Backend::Dir {
            root: dir.to_path_buf(),
            known: Mutex::new(known),
        }))
    }

    fn with_backend(backend: Backend) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            tab: Uuid::new_v4(),
            origin: Arc::new(Origin { backend, events }),
        }
    }

    /// Another handle on the same origin, as if opened from a second tab.
    pub fn new_tab(&self) -> Self {
        Self {
            tab: Uuid::new_v4(),
            origin: self.origin.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match &self.origin.backend {
            Backend::Memory(map) => Ok(lock(map).get(key).cloned()),
            Backend::Dir { root, .. } => match std::fs::read_to_string(root.join(key)) {
                Ok(v) => Ok(Some(v)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(source) => Err(io_err(key, source)),
            },
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        match &self.origin.backend {
            Backend::Memory(map) => {
                lock(map).insert(key.to_string(), value.to_string());
            }
            Backend::Dir { root, known } => {
                let mut known = lock(known);
                // readers in other processes never see a half-written value
                let staged = root.join(format!(".{key}.{}", self.tab));
                std::fs::write(&staged, value).map_err(|e| io_err(key, e))?;
                std::fs::rename(&staged, root.join(key)).map_err(|e| io_err(key, e))?;
                known.insert(key.to_string(), value.to_string());
            }
        }
        self.announce(key, Some(value.to_string()));
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        match &self.origin.backend {
            Backend::Memory(map) => {
                lock(map).remove(key);
            }
            Backend::Dir { root, known } => {
                let mut known = lock(known);
                match std::fs::remove_file(root.join(key)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Err(io_err(key, source)),
                }
                known.remove(key);
            }
        }
        self.announce(key, None);
        Ok(())
    }

    pub fn subscribe(&self) -> StorageEvents {
        StorageEvents {
            tab: self.tab,
            rx: self.origin.events.subscribe(),
        }
    }

    /// Check a file-backed origin for writes made by other processes and
    /// announce them to every handle. In-memory origins return `None`.
    pub fn spawn_dir_watch(&self, every: Duration) -> Option<JoinHandle<()>> {
        if !matches!(self.origin.backend, Backend::Dir { .. }) {
            return None;
        }
        let storage = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match storage.changes_on_disk() {
                    Ok(events) => {
                        for event in events {
                            debug!(key = %event.key, "storage changed by another process");
                            storage.publish(ANOTHER_PROCESS, event);
                        }
                    }
                    Err(e) => warn!(error = %e, "storage poll failed"),
                }
            }
        }))
    }

    fn changes_on_disk(&self) -> Result<Vec<StorageEvent>, StorageError> {
        let Backend::Dir { root, known } = &self.origin.backend else {
            return Ok(Vec::new());
        };
        let mut known = lock(known);
        let disk = read_dir_values(root)?;

        let mut events: Vec<StorageEvent> = disk
            .iter()
            .filter(|(key, value)| known.get(*key) != Some(*value))
            .map(|(key, value)| StorageEvent {
                key: key.clone(),
                new_value: Some(value.clone()),
            })
            .collect();
        events.extend(
            known
                .keys()
                .filter(|key| !disk.contains_key(*key))
                .map(|key| StorageEvent {
                    key: key.clone(),
                    new_value: None,
                }),
        );
        *known = disk;
        Ok(events)
    }

    fn announce(&self, key: &str, new_value: Option<String>) {
        self.publish(
            self.tab,
            StorageEvent {
                key: key.to_string(),
                new_value,
            },
        );
    }

    fn publish(&self, tab: Uuid, event: StorageEvent) {
        // no subscribers is fine
        let _ = self.origin.events.send(Envelope { tab, event });
    }

    // --- token helpers: writers are restricted to the API client and auth store ---

    pub fn access_token(&self) -> Result<Option<String>, StorageError> {
        self.get(ACCESS_TOKEN)
    }

    pub fn refresh_token(&self) -> Result<Option<String>, StorageError> {
        self.get(REFRESH_TOKEN)
    }

    pub fn has_access_token(&self) -> bool {
        matches!(self.access_token(), Ok(Some(t)) if !t.is_empty())
    }

    pub(crate) fn store_tokens(&self, tokens: &TokenPair) -> Result<(), StorageError> {
        self.set(ACCESS_TOKEN, &tokens.access)?;
        self.set(REFRESH_TOKEN, &tokens.refresh)
    }

    pub(crate) fn store_access_token(&self, access: &str) -> Result<(), StorageError> {
        self.set(ACCESS_TOKEN, access)
    }

    pub(crate) fn clear_tokens(&self) -> Result<(), StorageError> {
        self.remove(ACCESS_TOKEN)?;
        self.remove(REFRESH_TOKEN)
    }
}

pub struct StorageEvents {
    tab: Uuid,
    rx: broadcast::Receiver<Envelope>,
}

impl StorageEvents {
    /// Next change made by another handle. `None` once the origin is gone.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(env) if env.tab == self.tab => continue,
                Ok(env) => return Some(env.event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "storage events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_dir_values(root: &Path) -> Result<HashMap<String, String>, StorageError> {
    let dir_err = |source| io_err(&root.display().to_string(), source);
    let mut values = HashMap::new();
    for entry in std::fs::read_dir(root).map_err(dir_err)? {
        let entry = entry.map_err(dir_err)?;
        let Some(key) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if key.starts_with('.') {
            continue;
        }
        if !entry.path().is_file() {
            continue;
        }
        match std::fs::read_to_string(entry.path()) {
            Ok(value) => {
                values.insert(key, value);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(io_err(&key, source)),
        }
    }
    Ok(values)
}

fn io_err(key: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        source,
    }
}
