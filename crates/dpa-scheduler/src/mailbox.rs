//! Single-consumer mailbox with ordered delivery and an explicit
//! close/drain protocol, used to feed the scheduler service thread.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("mailbox is closed")]
pub struct MailboxClosed;

pub fn mailbox<T>() -> (MailboxSender<T>, Mailbox<T>) {
    let (tx, rx) = mpsc::channel();
    (MailboxSender { tx }, Mailbox { rx })
}

/// Producer half; cheap to clone. Messages from one sender arrive in send
/// order; messages from different senders in arrival order.
#[derive(Debug)]
pub struct MailboxSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> MailboxSender<T> {
    pub fn send(&self, message: T) -> Result<(), MailboxClosed> {
        self.tx.send(message).map_err(|_| MailboxClosed)
    }
}

/// Consumer half; owned by exactly one thread.
#[derive(Debug)]
pub struct Mailbox<T> {
    rx: mpsc::Receiver<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome<T> {
    Message(T),
    TimedOut,
    /// Every sender is gone; no further message can arrive.
    Closed,
}

impl<T> Mailbox<T> {
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> RecvOutcome<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => RecvOutcome::Message(message),
            Err(RecvTimeoutError::Timeout) => RecvOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => RecvOutcome::Closed,
        }
    }

    /// Takes everything already queued without blocking; used to reject
    /// queued requests during shutdown.
    pub fn drain(&self) -> Vec<T> {
        let mut drained = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            drained.push(message);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_order() {
        let (tx, rx) = mailbox();
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.recv(), Some(2));
        assert_eq!(rx.recv(), Some(3));
    }

    #[test]
    fn send_fails_after_consumer_drops() {
        let (tx, rx) = mailbox();
        drop(rx);
        assert_eq!(tx.send(1), Err(MailboxClosed));
    }

    #[test]
    fn drain_empties_the_queue() {
        let (tx, rx) = mailbox();
        tx.send('a').unwrap();
        tx.send('b').unwrap();
        assert_eq!(rx.drain(), vec!['a', 'b']);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn recv_timeout_reports_closure() {
        let (tx, rx) = mailbox::<u8>();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(1)),
            RecvOutcome::TimedOut
        );
        drop(tx);
        assert_eq!(rx.recv_timeout(Duration::from_millis(1)), RecvOutcome::Closed);
    }
}
