//! Request cancellation.
//!
//! A [`Cancellation`] is handed to every service call. It fires when the
//! owning [`CancelHandle`] is triggered or dropped, or when the optional
//! deadline passes. Work raced against it with [`Cancellation::run`] is
//! dropped on cancellation; a transaction dropped before commit rolls back.

use std::future::Future;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{JourneyError, Result};

/// Sender side. Dropping it cancels every linked [`Cancellation`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// A token that never fires.
    pub fn none() -> Self {
        Self {
            rx: None,
            deadline: None,
        }
    }

    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            Self {
                rx: Some(rx),
                deadline: None,
            },
        )
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: std::time::Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return true;
        }
        match &self.rx {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    /// Fail fast with [`JourneyError::Cancelled`] if already cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(JourneyError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token fires. Pends forever for [`Cancellation::none`].
    pub async fn cancelled(&self) {
        let signal = async {
            match self.rx.clone() {
                Some(mut rx) => {
                    // Err means the handle was dropped, which also cancels.
                    let _ = rx.wait_for(|c| *c).await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = signal => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => signal.await,
        }
    }

    /// Run `fut` unless the token fires first. On cancellation `fut` is
    /// dropped, releasing whatever it holds.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(JourneyError::Cancelled),
            out = fut => out,
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn none_never_fires() {
        let c = Cancellation::none();
        assert!(!c.is_cancelled());
        let out = c.run(async { Ok(7) }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn cancel_interrupts_pending_work() {
        let (handle, c) = Cancellation::new();
        let task = tokio::spawn(async move {
            c.run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
        });
        tokio::task::yield_now().await;
        handle.cancel();
        let res = task.await.unwrap();
        assert!(matches!(res, Err(JourneyError::Cancelled)));
    }

    #[tokio::test]
    async fn dropping_handle_cancels() {
        let (handle, c) = Cancellation::new();
        drop(handle);
        assert!(c.is_cancelled());
        assert!(matches!(c.check(), Err(JourneyError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires() {
        let c = Cancellation::none().with_timeout(Duration::from_millis(50));
        let res = c
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(JourneyError::Cancelled)));
        assert!(c.is_cancelled());
    }
}
