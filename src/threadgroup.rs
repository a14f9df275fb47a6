//! Structured shutdown accounting.
//!
//! A thread group tracks in-flight work with a counter and publishes a stop
//! signal through a watch channel. `stop` flips the signal, runs the on-stop
//! hooks, waits for the counter to reach zero, then runs the after-stop hooks.
//! Long-lived loops hold a [`WorkGuard`] and select on [`ThreadGroup::stop_signal`]
//! so shutdown never blocks on a sleeping task.
//!
//! The gateway runs two independent groups: one for short-lived work and one
//! for peer sessions, which can live for the lifetime of the process and must
//! quiesce before the primary group finishes shutting down.

use crate::error::{Error, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::Duration;

type Hook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct ThreadGroup {
    inner: Arc<Inner>,
}

struct Inner {
    stop_tx: watch::Sender<bool>,
    count_tx: watch::Sender<u64>,
    hooks: Mutex<Hooks>,
}

#[derive(Default)]
struct Hooks {
    stopped: bool,
    on_stop: Vec<Hook>,
    after_stop: Vec<Hook>,
}

/// Registration of one unit of in-flight work. Dropping it marks the work done.
pub struct WorkGuard {
    count_tx: watch::Sender<u64>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.count_tx.send_modify(|c| *c -= 1);
    }
}

impl ThreadGroup {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (count_tx, _) = watch::channel(0u64);
        ThreadGroup {
            inner: Arc::new(Inner {
                stop_tx,
                count_tx,
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    /// Register one unit of in-flight work. Fails once shutdown has begun.
    pub fn add(&self) -> Result<WorkGuard> {
        let hooks = self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        if hooks.stopped {
            return Err(Error::Shutdown);
        }
        self.inner.count_tx.send_modify(|c| *c += 1);
        Ok(WorkGuard { count_tx: self.inner.count_tx.clone() })
    }

    /// A receiver that flips to `true` when `stop` is called.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.inner.stop_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    /// Run `f` the moment `stop` is called, before waiting for in-flight work.
    /// Hooks run in reverse registration order. If the group is already
    /// stopped, `f` runs immediately.
    pub fn on_stop(&self, f: impl FnOnce() + Send + 'static) {
        let mut hooks = self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        if hooks.stopped {
            drop(hooks);
            f();
            return;
        }
        hooks.on_stop.push(Box::new(f));
    }

    /// Run `f` after `stop` has drained all in-flight work. Hooks run in
    /// reverse registration order.
    pub fn after_stop(&self, f: impl FnOnce() + Send + 'static) {
        let mut hooks = self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        if hooks.stopped {
            drop(hooks);
            f();
            return;
        }
        hooks.after_stop.push(Box::new(f));
    }

    /// Begin shutdown: flip the stop signal, run on-stop hooks, wait for the
    /// work counter to hit zero, then run after-stop hooks. A second call
    /// returns [`Error::Shutdown`].
    pub async fn stop(&self) -> Result<()> {
        let on_stop = {
            let mut hooks = self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner);
            if hooks.stopped {
                return Err(Error::Shutdown);
            }
            hooks.stopped = true;
            std::mem::take(&mut hooks.on_stop)
        };
        let _ = self.inner.stop_tx.send(true);
        for f in on_stop.into_iter().rev() {
            f();
        }

        let mut count_rx = self.inner.count_tx.subscribe();
        while *count_rx.borrow_and_update() > 0 {
            if count_rx.changed().await.is_err() {
                break;
            }
        }

        let after_stop = {
            let mut hooks = self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut hooks.after_stop)
        };
        for f in after_stop.into_iter().rev() {
            f();
        }
        Ok(())
    }

    /// Sleep for `dur`, returning `true` if the full time elapsed and `false`
    /// if the sleep was cut short by shutdown.
    pub async fn sleep(&self, dur: Duration) -> bool {
        let mut stop_rx = self.stop_signal();
        if *stop_rx.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = stop_rx.changed() => false,
        }
    }
}

impl Default for ThreadGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn add_fails_after_stop() {
        let tg = ThreadGroup::new();
        let guard = tg.add().unwrap();
        drop(guard);
        tg.stop().await.unwrap();
        assert!(matches!(tg.add(), Err(Error::Shutdown)));
        assert!(matches!(tg.stop().await, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_work() {
        let tg = ThreadGroup::new();
        let guard = tg.add().unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let done2 = done.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            done2.store(true, Ordering::SeqCst);
            drop(guard);
        });

        tg.stop().await.unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn hooks_run_in_reverse_order() {
        let tg = ThreadGroup::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            tg.after_stop(move || order.lock().unwrap().push(i));
        }
        let order2 = order.clone();
        tg.on_stop(move || order2.lock().unwrap().push(99));
        tg.stop().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![99, 2, 1, 0]);
    }

    #[tokio::test]
    async fn on_stop_fires_before_quiescence() {
        let tg = ThreadGroup::new();
        let guard = tg.add().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        tg.on_stop(move || fired2.store(true, Ordering::SeqCst));

        let mut stop_rx = tg.stop_signal();
        let fired3 = fired.clone();
        let handle = tokio::spawn(async move {
            let _ = stop_rx.changed().await;
            // on_stop has run by the time the signal is observable and work
            // is still outstanding
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(fired3.load(Ordering::SeqCst));
            drop(guard);
        });
        tg.stop().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn sleep_interrupted_by_stop() {
        let tg = ThreadGroup::new();
        let tg2 = tg.clone();
        let task = tokio::spawn(async move { tg2.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tg.stop().await.unwrap();
        assert!(!task.await.unwrap());
    }

    #[tokio::test]
    async fn sleep_completes_when_not_stopped() {
        let tg = ThreadGroup::new();
        assert!(tg.sleep(Duration::from_millis(5)).await);
    }
}
