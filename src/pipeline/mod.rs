//! Concurrent pipeline stages
//!
//! Each endpoint runs two stages on dedicated threads joined by a bounded
//! crossbeam queue. Items travel as [`Flow::Next`]; the upstream stage
//! ends a normal run with [`Flow::Finish`]. Dropping the queue sender
//! without a `Finish` marks an abnormal end.

pub mod cancel;
pub mod receiver;
pub mod sender;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::fmt;
use std::time::Duration;

use crate::session::stats::StageStats;

pub use cancel::CancelToken;
pub use receiver::{DecodeStage, ReceiveStage, ReconstructedAudio};
pub use sender::{EncodeStage, SendStage};

/// Queue item
#[derive(Debug, Clone, PartialEq)]
pub enum Flow<T> {
    Next(T),
    Finish,
}

pub type FlowSender<T> = Sender<Flow<T>>;
pub type FlowReceiver<T> = Receiver<Flow<T>>;

/// Bounded single-producer single-consumer stage queue
pub fn queue<T>(capacity: usize) -> (FlowSender<T>, FlowReceiver<T>) {
    bounded(capacity.max(1))
}

/// Block until `item` is queued
///
/// Returns `false` if the session is cancelled while the queue stays full,
/// or if the consumer is gone.
pub fn push<T>(tx: &FlowSender<T>, item: Flow<T>, cancel: &CancelToken, poll: Duration) -> bool {
    let mut item = item;
    loop {
        match tx.send_timeout(item, poll) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if cancel.is_cancelled() {
                    return false;
                }
                item = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Take the next item
///
/// Items already queued are delivered even after cancellation; `None`
/// means the queue is idle and cancelled, or the producer is gone.
pub fn pop<T>(rx: &FlowReceiver<T>, cancel: &CancelToken, poll: Duration) -> Option<Flow<T>> {
    loop {
        match rx.recv_timeout(poll) {
            Ok(flow) => return Some(flow),
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    return None;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// How a stage stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEnd {
    /// Saw `Finish` (or the End message) and passed it on
    Finished,
    Cancelled,
    /// The connection was closed by the peer
    PeerClosed,
    Failed(String),
}

impl StageEnd {
    /// End for a stage whose neighbour went away
    fn interrupted(cancel: &CancelToken, what: &str) -> Self {
        if cancel.is_cancelled() {
            StageEnd::Cancelled
        } else {
            StageEnd::Failed(format!("{} stopped unexpectedly", what))
        }
    }
}

impl fmt::Display for StageEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageEnd::Finished => f.write_str("finished"),
            StageEnd::Cancelled => f.write_str("cancelled"),
            StageEnd::PeerClosed => f.write_str("peer closed"),
            StageEnd::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Returned by every stage thread
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stats: StageStats,
    pub end: StageEnd,
}
