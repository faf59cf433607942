//! Per-stage and per-session accounting
//!
//! Every stage owns a [`StageStats`] and hands it back when its thread
//! exits; the session freezes them into [`StageSnapshot`]s for the report.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

use crate::session::state::SessionState;

/// Count, total, min, max and mean of recorded durations
#[derive(Debug, Clone, Default)]
pub struct TimingStats {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl TimingStats {
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = self.max.max(elapsed);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn min(&self) -> Duration {
        self.min.unwrap_or_default()
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// Count, total, min, max and mean of recorded sizes in bytes
#[derive(Debug, Clone, Default)]
pub struct SizeStats {
    count: u64,
    total: u64,
    min: Option<u64>,
    max: u64,
}

impl SizeStats {
    pub fn record(&mut self, bytes: u64) {
        self.count += 1;
        self.total += bytes;
        self.min = Some(self.min.map_or(bytes, |m| m.min(bytes)));
        self.max = self.max.max(bytes);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn min(&self) -> u64 {
        self.min.unwrap_or(0)
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Encode,
    Send,
    Receive,
    Decode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Encode => "encode",
            Stage::Send => "send",
            Stage::Receive => "receive",
            Stage::Decode => "decode",
        };
        f.write_str(name)
    }
}

/// Mutable accumulator owned by a single stage
#[derive(Debug, Clone)]
pub struct StageStats {
    stage: Stage,
    started: Instant,
    timing: TimingStats,
    sizes: SizeStats,
    failures: u64,
    throttled: Duration,
}

impl StageStats {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            started: Instant::now(),
            timing: TimingStats::default(),
            sizes: SizeStats::default(),
            failures: 0,
            throttled: Duration::ZERO,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// One item processed in `elapsed`, producing `bytes`
    pub fn record(&mut self, elapsed: Duration, bytes: u64) {
        self.timing.record(elapsed);
        self.sizes.record(bytes);
    }

    /// One item dropped
    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn set_throttled(&mut self, throttled: Duration) {
        self.throttled = throttled;
    }

    pub fn items(&self) -> u64 {
        self.timing.count()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn bytes(&self) -> u64 {
        self.sizes.total()
    }

    pub fn timing(&self) -> &TimingStats {
        &self.timing
    }

    pub fn sizes(&self) -> &SizeStats {
        &self.sizes
    }

    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            stage: self.stage,
            items: self.timing.count(),
            failures: self.failures,
            busy_secs: self.timing.total().as_secs_f64(),
            mean_secs: self.timing.mean().as_secs_f64(),
            min_secs: self.timing.min().as_secs_f64(),
            max_secs: self.timing.max().as_secs_f64(),
            bytes: self.sizes.total(),
            mean_bytes: self.sizes.mean(),
            min_bytes: self.sizes.min(),
            max_bytes: self.sizes.max(),
            throttled_secs: self.throttled.as_secs_f64(),
            wall_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

/// Frozen view of a stage's accounting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub stage: Stage,
    pub items: u64,
    pub failures: u64,
    pub busy_secs: f64,
    pub mean_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub bytes: u64,
    pub mean_bytes: f64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub throttled_secs: f64,
    pub wall_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    PeerClosed,
    Failed(String),
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed)
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed => f.write_str("completed"),
            SessionOutcome::Cancelled => f.write_str("cancelled"),
            SessionOutcome::PeerClosed => f.write_str("peer closed"),
            SessionOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Performance report produced at teardown, also on abnormal ends
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub role: Role,
    pub outcome: SessionOutcome,
    pub final_state: SessionState,
    pub elapsed_secs: f64,
    /// Chunks handled by the first stage (encoded or reconstructed)
    pub chunks: u64,
    /// Data packets written or read
    pub packets: u64,
    /// Data frame bytes on the wire, length prefixes included
    pub bytes: u64,
    /// Messages dropped as malformed (receiver only)
    pub malformed: u64,
    pub stages: Vec<StageSnapshot>,
}

impl SessionReport {
    /// Average wire throughput over the whole session
    pub fn bytes_per_second(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.bytes as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }

    /// Share of the session a stage spent working, in percent
    pub fn busy_ratio(&self, stage: Stage) -> f64 {
        match self.stages.iter().find(|s| s.stage == stage) {
            Some(s) if self.elapsed_secs > 0.0 => s.busy_secs / self.elapsed_secs * 100.0,
            _ => 0.0,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageSnapshot> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Log the performance report
    pub fn log_summary(&self) {
        info!("=== {} session {} ===", self.role, self.session_id);
        info!(
            "Outcome: {} (state {}), elapsed {:.2}s",
            self.outcome, self.final_state, self.elapsed_secs
        );
        info!(
            "Chunks: {}, packets: {}, bytes: {} ({:.2} bytes/s)",
            self.chunks,
            self.packets,
            self.bytes,
            self.bytes_per_second()
        );
        if self.malformed > 0 {
            info!("Malformed messages dropped: {}", self.malformed);
        }

        for s in &self.stages {
            if s.items == 0 {
                info!("{}: no items", s.stage);
                continue;
            }
            info!(
                "{}: {} items, {} failed, total {:.3}s, avg {:.4}s, min {:.4}s, max {:.4}s",
                s.stage, s.items, s.failures, s.busy_secs, s.mean_secs, s.min_secs, s.max_secs
            );
            info!(
                "{}: avg {:.2} bytes, min {} bytes, max {} bytes",
                s.stage, s.mean_bytes, s.min_bytes, s.max_bytes
            );
            if s.throttled_secs > 0.0 {
                info!("{}: throttled {:.3}s", s.stage, s.throttled_secs);
            }
        }

        let busy: f64 = self.stages.iter().map(|s| self.busy_ratio(s.stage)).sum();
        for s in &self.stages {
            info!("{} time ratio: {:.2}%", s.stage, self.busy_ratio(s.stage));
        }
        info!("Idle time ratio: {:.2}%", (100.0 - busy).max(0.0));
    }
}
