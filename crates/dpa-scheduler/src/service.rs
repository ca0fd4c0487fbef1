//! Queued front-end: a dedicated thread owns the scheduler and applies
//! requests strictly in submission order.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dpa_model::KeyValuePair;

use crate::error::SchedulerError;
use crate::mailbox::{Mailbox, MailboxSender, RecvOutcome, mailbox};
use crate::notify::SbNotification;
use crate::scheduler::KVScheduler;
use crate::txn::{Transaction, TxnResult};

/// How often the service checks for due retries while idle.
const IDLE_TICK: Duration = Duration::from_millis(200);

enum Request {
    Commit {
        txn: Transaction,
        reply: mpsc::Sender<Result<TxnResult, SchedulerError>>,
    },
    Resync {
        declared: Vec<KeyValuePair>,
        reply: mpsc::Sender<Result<TxnResult, SchedulerError>>,
    },
    Notify {
        notification: SbNotification,
    },
    Shutdown,
}

/// Handle to a running scheduler service. Submissions block until the
/// request was executed and return the per-key result; requests still queued
/// at shutdown are rejected with [`SchedulerError::ShutDown`] before any
/// backend call is made.
pub struct SchedulerHandle {
    sender: MailboxSender<Request>,
    join: Option<JoinHandle<KVScheduler>>,
}

/// Cloneable submitter for additional northbound clients.
#[derive(Clone)]
pub struct SchedulerClient {
    sender: MailboxSender<Request>,
}

pub struct SchedulerService;

impl SchedulerService {
    /// Moves the scheduler onto its own thread and returns the handle used
    /// to talk to it.
    pub fn spawn(scheduler: KVScheduler) -> SchedulerHandle {
        let (sender, inbox) = mailbox();
        let join = thread::Builder::new()
            .name("kvscheduler".to_string())
            .spawn(move || run(scheduler, inbox))
            .expect("failed to spawn scheduler thread");
        SchedulerHandle {
            sender,
            join: Some(join),
        }
    }
}

fn run(mut scheduler: KVScheduler, inbox: Mailbox<Request>) -> KVScheduler {
    loop {
        let timeout = scheduler
            .next_retry_due()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_TICK);
        match inbox.recv_timeout(timeout) {
            RecvOutcome::Message(Request::Commit { txn, reply }) => {
                let _ = reply.send(scheduler.commit(txn));
            }
            RecvOutcome::Message(Request::Resync { declared, reply }) => {
                let _ = reply.send(scheduler.resync(declared));
            }
            RecvOutcome::Message(Request::Notify { notification }) => {
                let result = scheduler.handle_notification(notification);
                if !result.is_clean() {
                    log::warn!("SB notification left failures: {:?}", result.errors());
                }
            }
            RecvOutcome::Message(Request::Shutdown) | RecvOutcome::Closed => {
                // Cancel everything still queued; nothing of it has touched
                // a backend yet.
                for request in inbox.drain() {
                    match request {
                        Request::Commit { reply, .. } | Request::Resync { reply, .. } => {
                            let _ = reply.send(Err(SchedulerError::ShutDown));
                        }
                        Request::Notify { .. } | Request::Shutdown => {}
                    }
                }
                return scheduler;
            }
            RecvOutcome::TimedOut => {}
        }
        for result in scheduler.process_retries(Instant::now()) {
            if !result.is_clean() {
                log::debug!("retry txn #{} still failing: {:?}", result.seq, result.errors());
            }
        }
    }
}

impl SchedulerHandle {
    pub fn client(&self) -> SchedulerClient {
        SchedulerClient {
            sender: self.sender.clone(),
        }
    }

    pub fn commit(&self, txn: Transaction) -> Result<TxnResult, SchedulerError> {
        self.client().commit(txn)
    }

    pub fn resync(&self, declared: Vec<KeyValuePair>) -> Result<TxnResult, SchedulerError> {
        self.client().resync(declared)
    }

    pub fn notify(&self, notification: SbNotification) -> Result<(), SchedulerError> {
        self.client().notify(notification)
    }

    /// Stops the service thread and hands the scheduler back for
    /// inspection. Queued requests are rejected, the in-flight one (if any)
    /// runs to completion first.
    pub fn shutdown(mut self) -> Result<KVScheduler, SchedulerError> {
        let _ = self.sender.send(Request::Shutdown);
        let join = self.join.take().ok_or(SchedulerError::ShutDown)?;
        join.join().map_err(|_| SchedulerError::ShutDown)
    }
}

impl SchedulerClient {
    pub fn commit(&self, txn: Transaction) -> Result<TxnResult, SchedulerError> {
        let (tx, rx) = mpsc::channel();
        self.sender
            .send(Request::Commit { txn, reply: tx })
            .map_err(|_| SchedulerError::ShutDown)?;
        rx.recv().map_err(|_| SchedulerError::ShutDown)?
    }

    pub fn resync(&self, declared: Vec<KeyValuePair>) -> Result<TxnResult, SchedulerError> {
        let (tx, rx) = mpsc::channel();
        self.sender
            .send(Request::Resync { declared, reply: tx })
            .map_err(|_| SchedulerError::ShutDown)?;
        rx.recv().map_err(|_| SchedulerError::ShutDown)?
    }

    pub fn notify(&self, notification: SbNotification) -> Result<(), SchedulerError> {
        self.sender
            .send(Request::Notify { notification })
            .map_err(|_| SchedulerError::ShutDown)
    }
}
