//! Timer bookkeeping for the slot manager.
//!
//! Timers are plain deadlines. Nothing fires on its own thread: the owner
//! polls [`Timers::expired`] from its processing context, so expiry is
//! serialized with frame handling.

use std::fmt;

/// Which programming timeout is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Bounds the wait for a command-station acknowledgment.
    Short,
    /// Bounds a full decoder round trip on the service track.
    Long,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Short => write!(f, "short"),
            TimeoutKind::Long => write!(f, "long"),
        }
    }
}

/// A timer that came due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expired<D> {
    Programming(TimeoutKind),
    BlindCompletion,
    PowerRestore,
    StaleSweep,
    RefreshNext,
    Deliver(D),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadline<K> {
    at: u64,
    kind: K,
}

/// All deadlines owned by one slot manager.
///
/// `D` is the payload of deferred deliveries.
#[derive(Debug)]
pub struct Timers<D> {
    programming: Option<Deadline<TimeoutKind>>,
    blind_completion: Option<u64>,
    power_restore: Option<u64>,
    stale_sweep: Option<u64>,
    stale_interval_ms: u64,
    refresh: Option<u64>,
    deferred: Vec<Deadline<D>>,
}

impl<D> Timers<D> {
    pub fn new() -> Self {
        Self {
            programming: None,
            blind_completion: None,
            power_restore: None,
            stale_sweep: None,
            stale_interval_ms: 0,
            refresh: None,
            deferred: Vec::new(),
        }
    }

    /// Arm the programming timeout, replacing whichever one was armed.
    pub fn arm_programming(&mut self, kind: TimeoutKind, at: u64) {
        self.programming = Some(Deadline { at, kind });
    }

    pub fn cancel_programming(&mut self) {
        self.programming = None;
    }

    pub fn arm_blind_completion(&mut self, at: u64) {
        self.blind_completion = Some(at);
    }

    /// Arm (or re-arm) the one-shot power restore.
    pub fn arm_power_restore(&mut self, at: u64) {
        self.power_restore = Some(at);
    }

    pub fn cancel_power_restore(&mut self) {
        self.power_restore = None;
    }

    pub fn power_restore_armed(&self) -> bool {
        self.power_restore.is_some()
    }

    /// Start the periodic stale sweep: first at `first_at`, then every `interval_ms`.
    pub fn start_stale_sweep(&mut self, first_at: u64, interval_ms: u64) {
        self.stale_sweep = Some(first_at);
        self.stale_interval_ms = interval_ms.max(1);
    }

    pub fn arm_refresh(&mut self, at: u64) {
        self.refresh = Some(at);
    }

    /// Queue `payload` for delivery at `at`.
    pub fn defer(&mut self, at: u64, payload: D) {
        self.deferred.push(Deadline { at, kind: payload });
    }

    pub fn pending_deliveries(&self) -> usize {
        self.deferred.len()
    }

    /// Earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.programming.map(|d| d.at),
            self.blind_completion,
            self.power_restore,
            self.stale_sweep,
            self.refresh,
        ]
        .into_iter()
        .flatten()
        .chain(self.deferred.iter().map(|d| d.at))
        .min()
    }

    /// Take everything due at `now`.
    ///
    /// One-shots are disarmed; the stale sweep is re-armed one interval on.
    /// Deliveries come out in deadline order, ahead of the other timers.
    pub fn expired(&mut self, now: u64) -> Vec<Expired<D>> {
        let mut out = Vec::new();

        if self.deferred.iter().any(|d| d.at <= now) {
            let (mut due, rest): (Vec<_>, Vec<_>) =
                self.deferred.drain(..).partition(|d| d.at <= now);
            self.deferred = rest;
            due.sort_by_key(|d| d.at);
            out.extend(due.into_iter().map(|d| Expired::Deliver(d.kind)));
        }

        if let Some(d) = self.programming
            && d.at <= now
        {
            self.programming = None;
            out.push(Expired::Programming(d.kind));
        }
        if self.blind_completion.is_some_and(|at| at <= now) {
            self.blind_completion = None;
            out.push(Expired::BlindCompletion);
        }
        if self.power_restore.is_some_and(|at| at <= now) {
            self.power_restore = None;
            out.push(Expired::PowerRestore);
        }
        if let Some(at) = self.stale_sweep
            && at <= now
        {
            let mut next = at + self.stale_interval_ms;
            if next <= now {
                next = now + self.stale_interval_ms;
            }
            self.stale_sweep = Some(next);
            out.push(Expired::StaleSweep);
        }
        if self.refresh.is_some_and(|at| at <= now) {
            self.refresh = None;
            out.push(Expired::RefreshNext);
        }
        out
    }
}

impl<D> Default for Timers<D> {
    fn default() -> Self {
        Self::new()
    }
}
