//! Resettable one-shot timer backed by a dedicated thread.

use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

enum Command {
    Reset,
    Stop,
}

/// Fires its callback once, a full `interval` after the most recent
/// [`reset`](OneShotTimer::reset), then goes back to idle until the next
/// reset. The callback runs on the timer thread, so it must stay cheap and
/// must never take locks shared with timer users.
pub struct OneShotTimer {
    tx: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl OneShotTimer {
    pub fn new(interval: Duration, on_timeout: impl Fn() + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || Self::run(rx, interval, on_timeout));
        Self {
            tx,
            worker: Some(worker),
        }
    }

    /// Arm the timer, or push an armed timer's deadline out by a full
    /// interval.
    pub fn reset(&self) {
        let _ = self.tx.send(Command::Reset);
    }

    fn run(rx: Receiver<Command>, interval: Duration, on_timeout: impl Fn()) {
        loop {
            // Idle until armed.
            match rx.recv() {
                Ok(Command::Reset) => {}
                Ok(Command::Stop) | Err(_) => return,
            }
            // Armed: every reset reopens the window.
            loop {
                match rx.recv_timeout(interval) {
                    Ok(Command::Reset) => {}
                    Ok(Command::Stop) => return,
                    Err(RecvTimeoutError::Timeout) => {
                        on_timeout();
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        }
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use test_log::test;

    use super::*;

    #[test]
    fn fires_once_per_arm() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = OneShotTimer::new(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 0, "idle until armed");

        timer.reset();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Stays idle after firing.
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_postpones_the_deadline() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = OneShotTimer::new(Duration::from_millis(80), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        timer.reset();
        for _ in 0..4 {
            thread::sleep(Duration::from_millis(30));
            timer.reset();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0, "kept alive by resets");

        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
