//! Notification Dispatch
//!
//! Every session owns a single notification channel. One task drains it in
//! order and awaits each watcher before taking the next notification, so
//! watcher callbacks on the same session never run concurrently. Session
//! lifecycle changes are published to a `watch` channel that the host (or
//! anything else) can wait on.

use tokio::sync::{mpsc, watch};

use super::{Notification, SessionState};

/// Receiving half of a session's notification channel
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

/// Sending half of a session's notification channel
pub type NotificationSender = mpsc::UnboundedSender<Notification>;

/// Serialized delivery of a session's notifications
pub struct EventDispatcher;

impl EventDispatcher {
    /// Spawn the delivery task for `events`
    pub fn start(mut events: NotificationReceiver) -> SessionMonitor {
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);

        tokio::spawn(async move {
            while let Some(notification) = events.recv().await {
                match notification {
                    Notification::Node { watcher, event } => {
                        tracing::trace!("Delivering {} for {}", event.kind, event.path);
                        watcher.process(event).await;
                    }
                    Notification::Session(state) => {
                        match state {
                            SessionState::Connected => {
                                tracing::info!("Connected to coordination service")
                            }
                            _ => tracing::info!("Coordination session {}", state),
                        }
                        state_tx.send_replace(state);
                        if state.is_terminal() {
                            break;
                        }
                    }
                }
            }

            // Sender dropped without a terminal event
            if !state_tx.borrow().is_terminal() {
                tracing::warn!("Notification channel closed, treating session as disconnected");
                state_tx.send_replace(SessionState::Disconnected);
            }
            tracing::debug!("Notification dispatcher stopped");
        });

        SessionMonitor { state: state_rx }
    }
}

/// Observer of a session's lifecycle
#[derive(Clone)]
pub struct SessionMonitor {
    state: watch::Receiver<SessionState>,
}

impl SessionMonitor {
    /// Latest observed session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Block until the session reaches a terminal state
    pub async fn wait_for_disconnect(&self) -> SessionState {
        let mut state = self.state.clone();
        let terminal = match state.wait_for(|s| s.is_terminal()).await {
            Ok(s) => *s,
            Err(_) => SessionState::Disconnected,
        };
        terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{EventKind, WatchedEvent, Watcher};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct SlowRecorder {
        seen: Mutex<Vec<String>>,
        active: std::sync::atomic::AtomicUsize,
        overlap: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Watcher for SlowRecorder {
        async fn process(&self, event: WatchedEvent) {
            use std::sync::atomic::Ordering;
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlap.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.seen.lock().await.push(event.path);
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_delivery_is_serialized_and_ordered() {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = EventDispatcher::start(rx);
        let recorder = Arc::new(SlowRecorder {
            seen: Mutex::new(Vec::new()),
            active: std::sync::atomic::AtomicUsize::new(0),
            overlap: std::sync::atomic::AtomicBool::new(false),
        });

        for i in 0..5 {
            tx.send(Notification::Node {
                watcher: recorder.clone(),
                event: WatchedEvent {
                    kind: EventKind::NodeDeleted,
                    path: format!("/election/c_{:010}", i),
                },
            })
            .unwrap();
        }
        tx.send(Notification::Session(SessionState::Closed)).unwrap();

        assert_eq!(monitor.wait_for_disconnect().await, SessionState::Closed);

        let seen = recorder.seen.lock().await.clone();
        let expected: Vec<String> = (0..5).map(|i| format!("/election/c_{:010}", i)).collect();
        assert_eq!(seen, expected);
        assert!(!recorder.overlap.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_monitor_reports_connected_until_terminal() {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = EventDispatcher::start(rx);

        tx.send(Notification::Session(SessionState::Connected)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.state(), SessionState::Connected);

        let waiter = monitor.clone();
        let wait = tokio::spawn(async move { waiter.wait_for_disconnect().await });

        tx.send(Notification::Session(SessionState::Expired)).unwrap();
        assert_eq!(wait.await.unwrap(), SessionState::Expired);
        assert_eq!(monitor.wait_for_disconnect().await, SessionState::Expired);
    }

    #[tokio::test]
    async fn test_dropped_channel_counts_as_disconnect() {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = EventDispatcher::start(rx);
        drop(tx);

        assert_eq!(monitor.wait_for_disconnect().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_every_waiter_sees_terminal_state() {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = EventDispatcher::start(rx);

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let monitor = monitor.clone();
                tokio::spawn(async move { monitor.wait_for_disconnect().await })
            })
            .collect();

        tx.send(Notification::Session(SessionState::Closed)).unwrap();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), SessionState::Closed);
        }
        // Already terminal: resolves immediately
        assert_eq!(monitor.wait_for_disconnect().await, SessionState::Closed);
    }
}
