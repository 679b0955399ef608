use std::time::Duration;

use tokio::time::Instant;

/// Default coalescing window for text deltas.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(50);

/// Coalesces text deltas into time-bounded batches.
///
/// The first `append` after a flush arms a one-shot timer. Later appends join
/// the same batch without pushing the deadline back, so a fast stream still
/// flushes every `interval`.
///
/// The batcher never sleeps on its own; the owner polls [`wait_due`] and calls
/// [`expire`] when it resolves.
///
/// [`wait_due`]: DeltaBatcher::wait_due
/// [`expire`]: DeltaBatcher::expire
pub struct DeltaBatcher<F>
where
    F: FnMut(String),
{
    buffer: String,
    deadline: Option<Instant>,
    interval: Duration,
    on_flush: F,
}

impl<F> DeltaBatcher<F>
where
    F: FnMut(String),
{
    /// Creates an empty batcher that delivers batches to `on_flush`.
    pub fn new(interval: Duration, on_flush: F) -> Self {
        Self {
            buffer: String::new(),
            deadline: None,
            interval,
            on_flush,
        }
    }

    /// Appends `text` to the pending batch and arms the timer if idle.
    pub fn append(&mut self, text: &str) {
        self.buffer.push_str(text);
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.interval);
        }
    }

    /// Returns true while a flush timer is armed.
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Text accumulated since the last flush.
    pub fn pending_text(&self) -> &str {
        &self.buffer
    }

    /// Resolves when the armed timer is due; never resolves when idle.
    pub async fn wait_due(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Timer expiry: delivers the batch if non-empty and disarms.
    pub fn expire(&mut self) {
        self.deadline = None;
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        (self.on_flush)(batch);
    }

    /// Cancels the timer and delivers whatever is buffered, possibly empty.
    pub fn flush_now(&mut self) {
        self.deadline = None;
        let batch = std::mem::take(&mut self.buffer);
        (self.on_flush)(batch);
    }

    /// Cancels the timer and drops buffered text without delivering it.
    pub fn dispose(&mut self) {
        self.deadline = None;
        self.buffer.clear();
    }
}
