use std::fmt;

/// Below this many seconds the timer is shown as running low.
pub const LOW_TIME_SECS: u32 = 300;
pub const CRITICAL_TIME_SECS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// `sync` is set on every `sync_every`-th tick while time remains.
    Running { remaining: u32, sync: bool },
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBand {
    Normal,
    Low,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    remaining: u32,
    ticks: u64,
    sync_every: u32,
}

impl Countdown {
    pub fn new(remaining_secs: u32, sync_every: u32) -> Self {
        Self {
            remaining: remaining_secs,
            ticks: 0,
            sync_every: sync_every.max(1),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn is_expired(&self) -> bool {
        self.remaining == 0
    }

    pub fn tick(&mut self) -> Tick {
        if self.remaining == 0 {
            return Tick::Expired;
        }
        self.remaining -= 1;
        self.ticks += 1;
        if self.remaining == 0 {
            return Tick::Expired;
        }
        Tick::Running {
            remaining: self.remaining,
            sync: self.ticks % u64::from(self.sync_every) == 0,
        }
    }

    pub fn band(&self) -> TimeBand {
        match self.remaining {
            r if r < CRITICAL_TIME_SECS => TimeBand::Critical,
            r if r < LOW_TIME_SECS => TimeBand::Low,
            _ => TimeBand::Normal,
        }
    }
}

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_clock(self.remaining))
    }
}

/// `MM:SS`; minutes keep counting past 59.
pub fn format_clock(secs: u32) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
