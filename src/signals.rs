use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppSignal {
    /// Something the catalog or progress depends on changed (quiz finished).
    DataChanged,
    /// The window regained input focus.
    FocusGained,
    VisibilityChanged { visible: bool },
}

#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<AppSignal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { tx }
    }

    pub fn emit(&self, signal: AppSignal) {
        debug!(?signal, "signal");
        let _ = self.tx.send(signal);
    }

    pub fn data_changed(&self) {
        self.emit(AppSignal::DataChanged);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppSignal> {
        self.tx.subscribe()
    }
}
