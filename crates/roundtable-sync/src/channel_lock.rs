use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use roundtable_core::error::{Result, RoundtableError};

struct Waiter {
    id: u64,
    label: String,
    tx: oneshot::Sender<()>,
}

struct Inner {
    locked: bool,
    holder: Option<String>,
    held_since: Option<Instant>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

/// FIFO mutex with timeout and lease keep-alive.
///
/// At most one turn engine holds this lock at a time, for the duration of a
/// turn (receive → deliver → compact). A background sweeper forcibly
/// releases a lock held past `lock_max` whenever waiters are queued, so one
/// wedged turn can't starve every other agent forever.
pub struct ChannelLock {
    inner: Mutex<Inner>,
    lock_max: Duration,
}

impl ChannelLock {
    pub fn new(lock_max: Duration) -> Arc<Self> {
        let lock = Arc::new(Self {
            inner: Mutex::new(Inner {
                locked: false,
                holder: None,
                held_since: None,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
            lock_max,
        });
        spawn_sweeper(lock.clone());
        lock
    }

    /// Acquire the lock, waiting in FIFO order behind any current holder.
    /// Fails with [`RoundtableError::LockTimeout`] if `timeout` elapses
    /// first.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
        label: impl Into<String>,
    ) -> Result<LockGuard> {
        let label = label.into();
        let pending = {
            let mut inner = self.inner.lock().await;
            if !inner.locked {
                inner.locked = true;
                inner.holder = Some(label.clone());
                inner.held_since = Some(Instant::now());
                None
            } else {
                let id = inner.next_waiter_id;
                inner.next_waiter_id += 1;
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(Waiter {
                    id,
                    label: label.clone(),
                    tx,
                });
                Some((id, rx))
            }
        };

        if let Some((id, rx)) = pending {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(())) => {
                    // The releaser already set holder/held_since for us.
                }
                Ok(Err(_)) | Err(_) => {
                    let mut inner = self.inner.lock().await;
                    inner.waiters.retain(|w| w.id != id);
                    return Err(RoundtableError::LockTimeout {
                        ms: timeout.as_millis() as u64,
                        holder_label: label,
                    });
                }
            }
        }

        Ok(LockGuard {
            lock: self.clone(),
            label,
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Refresh `held_since` to prove progress (called by streaming callers
    /// via `onData`).
    pub async fn touch(&self) {
        let mut inner = self.inner.lock().await;
        if inner.locked {
            inner.held_since = Some(Instant::now());
        }
    }

    /// Idempotent release. Hands off to the oldest waiter, if any.
    async fn release(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.locked {
            return;
        }
        match inner.waiters.pop_front() {
            Some(waiter) => {
                inner.holder = Some(waiter.label);
                inner.held_since = Some(Instant::now());
                // locked stays true — the queued waiter is now the holder.
                let _ = waiter.tx.send(());
            }
            None => {
                inner.locked = false;
                inner.holder = None;
                inner.held_since = None;
            }
        }
    }

    async fn sweep_once(&self) {
        let forced = {
            let mut inner = self.inner.lock().await;
            let stale = inner
                .held_since
                .map(|since| since.elapsed() > self.lock_max)
                .unwrap_or(false);
            if inner.locked && stale && !inner.waiters.is_empty() {
                let holder = inner.holder.clone();
                match inner.waiters.pop_front() {
                    Some(waiter) => {
                        inner.holder = Some(waiter.label);
                        inner.held_since = Some(Instant::now());
                        let _ = waiter.tx.send(());
                    }
                    None => {
                        inner.locked = false;
                        inner.holder = None;
                        inner.held_since = None;
                    }
                }
                holder
            } else {
                None
            }
        };
        if let Some(holder) = forced {
            warn!(holder = %holder, "channel lock: forced release — held past lock_max with waiters queued");
        }
    }
}

fn spawn_sweeper(lock: Arc<ChannelLock>) {
    let interval = lock.lock_max.min(Duration::from_millis(500));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            lock.sweep_once().await;
        }
    });
}

/// RAII handle returned by [`ChannelLock::acquire`].
///
/// `Drop` releases the lock on a best-effort basis (spawned, since `Drop`
/// cannot `await`) if the holder forgot to call [`LockGuard::release`]
/// explicitly — a panicking turn still frees the lock for the next agent.
pub struct LockGuard {
    lock: Arc<ChannelLock>,
    label: String,
    released: Arc<AtomicBool>,
}

impl LockGuard {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn touch(&self) {
        self.lock.touch().await;
    }

    pub async fn release(self) {
        self.released.store(true, Ordering::SeqCst);
        self.lock.release().await;
        info!(label = %self.label, "channel lock released");
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let lock = self.lock.clone();
        let label = self.label.clone();
        tokio::spawn(async move {
            warn!(label = %label, "channel lock: guard dropped without explicit release");
            lock.release().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_holder_invariant() {
        let lock = ChannelLock::new(Duration::from_secs(60));
        let guard = lock.acquire(Duration::from_millis(100), "a").await.unwrap();

        let lock2 = lock.clone();
        let second = tokio::spawn(async move {
            lock2
                .acquire(Duration::from_millis(50), "b")
                .await
        });

        // Second acquirer must time out while the first still holds it.
        let result = second.await.unwrap();
        assert!(result.is_err());
        guard.release().await;
    }

    #[tokio::test]
    async fn fifo_handoff_on_release() {
        let lock = ChannelLock::new(Duration::from_secs(60));
        let guard = lock.acquire(Duration::from_millis(500), "a").await.unwrap();

        let lock2 = lock.clone();
        let waiter = tokio::spawn(async move {
            lock2.acquire(Duration::from_secs(2), "b").await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.release().await;

        let handed_off = waiter.await.unwrap().unwrap();
        assert_eq!(handed_off.label(), "b");
    }

    #[tokio::test]
    async fn touch_refreshes_held_since() {
        let lock = ChannelLock::new(Duration::from_secs(60));
        let guard = lock.acquire(Duration::from_millis(100), "a").await.unwrap();
        guard.touch().await;
        guard.release().await;
    }
}
