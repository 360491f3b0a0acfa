use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::error;

/// Process-wide stop signal, plus the first fatal error that caused it.
pub struct Shutdown {
    tx: watch::Sender<bool>,
    fatal: Mutex<Option<String>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx,
            fatal: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Halt everything. Only the first message is kept.
    pub fn fatal(&self, message: impl Into<String>) {
        let message = message.into();
        error!(error = %message, "Fatal pipeline error, halting");
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(message);
            }
        }
        self.signal();
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_fatal_wins_and_wakes_subscribers() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!shutdown.is_signalled());

        shutdown.fatal("disk full");
        shutdown.fatal("second");

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert_eq!(shutdown.fatal_error().as_deref(), Some("disk full"));
    }
}
