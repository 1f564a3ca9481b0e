//! Applied-index watermark.
//!
//! Indices may be marked done in any order. The done-until frontier only
//! moves over a contiguous run of done indices, and waiters are released
//! once the frontier reaches their target.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::context::{Context, ContextError};

#[derive(Default)]
struct MarkState {
    done_until: u64,
    // Done indices above the frontier.
    pending: BTreeSet<u64>,
    waiters: BTreeMap<u64, Vec<oneshot::Sender<()>>>,
}

impl MarkState {
    fn advance(&mut self) {
        while self.pending.remove(&(self.done_until + 1)) {
            self.done_until += 1;
        }
    }

    fn release(&mut self) {
        let later = self.waiters.split_off(&(self.done_until + 1));
        let ready = std::mem::replace(&mut self.waiters, later);
        for tx in ready.into_values().flatten() {
            let _ = tx.send(());
        }
    }
}

pub struct WaterMark {
    name: String,
    done_until: AtomicU64,
    state: Mutex<MarkState>,
}

impl WaterMark {
    pub fn new(name: impl Into<String>) -> Self {
        WaterMark {
            name: name.into(),
            done_until: AtomicU64::new(0),
            state: Mutex::new(MarkState::default()),
        }
    }

    pub fn done_until(&self) -> u64 {
        self.done_until.load(Ordering::SeqCst)
    }

    /// Moves the frontier to `index` if it is ahead of the current one.
    /// Marks at or below `index` are forgotten and waiters up to it released.
    pub fn set_done_until(&self, index: u64) {
        let mut state = self.lock();
        if index <= state.done_until {
            return;
        }
        state.done_until = index;
        state.pending = state.pending.split_off(&(index + 1));
        state.advance();
        state.release();
        self.done_until.store(state.done_until, Ordering::SeqCst);
    }

    /// Marks a single index as done.
    pub fn done(&self, index: u64) {
        let mut state = self.lock();
        if index <= state.done_until {
            return;
        }
        state.pending.insert(index);
        let before = state.done_until;
        state.advance();
        if state.done_until != before {
            log::trace!(
                "{}: done until {} -> {}",
                self.name,
                before,
                state.done_until
            );
            state.release();
            self.done_until.store(state.done_until, Ordering::SeqCst);
        }
    }

    /// Waits until every index up to and including `index` is done.
    pub async fn wait_for_mark(&self, ctx: &Context, index: u64) -> Result<(), ContextError> {
        if self.done_until() >= index {
            return Ok(());
        }
        let rx = {
            let mut state = self.lock();
            if state.done_until >= index {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(index).or_default().push(tx);
            rx
        };

        tokio::select! {
            biased;
            _ = rx => Ok(()),
            err = ctx.done() => {
                self.forget_closed(index);
                Err(err)
            }
        }
    }

    fn forget_closed(&self, index: u64) {
        let mut state = self.lock();
        if let Some(waiters) = state.waiters.get_mut(&index) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                state.waiters.remove(&index);
            }
        }
    }

    // Nothing panics while holding the lock, so a poisoned state is intact.
    fn lock(&self) -> std::sync::MutexGuard<'_, MarkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.lock().waiters.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_reached() {
        let mark = WaterMark::new("applied");
        mark.set_done_until(10);
        mark.wait_for_mark(&Context::background(), 7).await.unwrap();
        mark.wait_for_mark(&Context::background(), 10).await.unwrap();
        assert_eq!(mark.done_until(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_marks() {
        let mark = Arc::new(WaterMark::new("applied"));
        mark.set_done_until(2);

        let m4 = mark.clone();
        let wait4 = tokio::spawn(async move { m4.wait_for_mark(&Context::background(), 4).await });
        let m5 = mark.clone();
        let wait5 = tokio::spawn(async move { m5.wait_for_mark(&Context::background(), 5).await });
        settle().await;

        mark.done(5);
        settle().await;
        assert!(!wait4.is_finished());
        assert!(!wait5.is_finished());
        assert_eq!(mark.done_until(), 2);

        mark.done(3);
        settle().await;
        assert!(!wait4.is_finished());
        assert_eq!(mark.done_until(), 3);

        mark.done(4);
        wait4.await.unwrap().unwrap();
        wait5.await.unwrap().unwrap();
        assert_eq!(mark.done_until(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled_by_context() {
        let mark = WaterMark::new("applied");
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let res = mark.wait_for_mark(&ctx, 3).await;
        assert_eq!(res, Err(ContextError::DeadlineExceeded));
        assert_eq!(mark.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_set_done_until_skips_gap() {
        let mark = Arc::new(WaterMark::new("applied"));
        mark.done(12);
        mark.done(11);
        let m = mark.clone();
        let waiter = tokio::spawn(async move { m.wait_for_mark(&Context::background(), 12).await });
        settle().await;

        // A snapshot at 10 closes the gap below the out-of-order marks.
        mark.set_done_until(10);
        waiter.await.unwrap().unwrap();
        assert_eq!(mark.done_until(), 12);

        mark.set_done_until(4);
        assert_eq!(mark.done_until(), 12);
        mark.done(9);
        assert_eq!(mark.done_until(), 12);
    }
}
