use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

/// Process-wide stop request shared by every bus worker and the publisher.
///
/// Triggering drops the only sender of an internal channel, which wakes every
/// blocked [`wait_timeout`](Self::wait_timeout) and [`wait`](Self::wait) at
/// once.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

struct Inner {
    triggered: AtomicBool,
    sender: Mutex<Option<flume::Sender<()>>>,
    receiver: flume::Receiver<()>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, receiver) = flume::bounded(1);
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                sender: Mutex::new(Some(sender)),
                receiver,
            }),
        }
    }

    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            log::info!("Shutdown requested");
        }
        self.inner.sender.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`. Returns true if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        match self.inner.receiver.recv_timeout(timeout) {
            Err(flume::RecvTimeoutError::Disconnected) => true,
            _ => self.is_triggered(),
        }
    }

    pub async fn wait(&self) {
        if self.is_triggered() {
            return;
        }
        // Nothing is ever sent; this only returns once the sender is dropped.
        let _ = self.inner.receiver.recv_async().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_without_trigger() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        assert!(!signal.is_triggered());
    }

    #[test]
    fn test_trigger_wakes_sleeping_thread() {
        let signal = ShutdownSignal::new();
        let sleeper = {
            let signal = signal.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                let stopped = signal.wait_timeout(Duration::from_secs(30));
                (stopped, started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        signal.trigger();
        signal.trigger();

        let (stopped, elapsed) = sleeper.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
        assert!(signal.wait_timeout(Duration::from_secs(30)));
    }

    #[test]
    fn test_async_wait_is_pending_until_triggered() {
        let signal = ShutdownSignal::new();
        let mut waiting = tokio_test::task::spawn(signal.wait());
        tokio_test::assert_pending!(waiting.poll());
        tokio_test::assert_pending!(waiting.poll());

        signal.trigger();
        tokio_test::assert_ready!(waiting.poll());
        drop(waiting);

        // Once triggered, later waiters resolve without parking.
        tokio_test::block_on(signal.wait());
    }

    #[tokio::test]
    async fn test_async_wait() {
        let signal = ShutdownSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });
        tokio::time::timeout(Duration::from_secs(5), signal.wait())
            .await
            .unwrap();
    }
}
