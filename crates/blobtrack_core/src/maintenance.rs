use std::thread;
use std::time::Duration;

use anyhow::Result;

/// Receives operator-facing progress lines from long-running operations.
/// The core never prints; the CLI passes a stdout sink, tests collect.
pub trait ProgressSink {
    fn line(&mut self, message: &str);
}

/// Discards progress output.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn line(&mut self, _message: &str) {}
}

/// Prints each progress line to stdout.
#[derive(Debug, Default)]
pub struct StdoutProgress;

impl ProgressSink for StdoutProgress {
    fn line(&mut self, message: &str) {
        println!("{message}");
    }
}

/// Outcome of waiting for replicas to reach the primary's write position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryPosWait {
    CaughtUp,
    TimedOut,
}

/// Replica catch-up barrier. Batch scans call `wait_for_replication` between
/// groups of batches so a lagging replica bounds how stale reads can get;
/// `wait_for_primary_pos` is the stronger pre-read barrier with a hard
/// timeout after which the caller proceeds anyway.
pub trait ReplicaBarrier {
    fn wait_for_replication(&mut self) -> Result<()>;
    fn wait_for_primary_pos(&mut self, timeout: Duration) -> Result<PrimaryPosWait>;
}

/// Barrier for a single-file database: there are no replicas to wait on.
#[derive(Debug, Default)]
pub struct SingleNodeBarrier;

impl ReplicaBarrier for SingleNodeBarrier {
    fn wait_for_replication(&mut self) -> Result<()> {
        Ok(())
    }

    fn wait_for_primary_pos(&mut self, _timeout: Duration) -> Result<PrimaryPosWait> {
        Ok(PrimaryPosWait::CaughtUp)
    }
}

/// Sleep between processed units when the operator asked for throttling.
pub fn throttle_sleep(millis: u64) {
    if millis > 0 {
        thread::sleep(Duration::from_millis(millis));
    }
}
