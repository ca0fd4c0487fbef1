//! Bounded in-memory record of planned and executed transactions.

use std::collections::VecDeque;
use std::time::SystemTime;

use dpa_model::Key;
use serde::Serialize;

use crate::graph::ValueState;
use crate::txn::TxnKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

/// One descriptor invocation (or validation verdict) within a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedOp {
    pub key: Key,
    pub operation: OpKind,
    pub prev_state: ValueState,
    pub new_state: ValueState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedTxn {
    pub seq: u64,
    pub kind: TxnKind,
    pub started: SystemTime,
    pub finished: SystemTime,
    /// Executed operations in execution order.
    pub ops: Vec<RecordedOp>,
}

#[derive(Debug)]
pub struct TxnHistory {
    records: VecDeque<RecordedTxn>,
    limit: usize,
}

impl TxnHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn record(&mut self, txn: RecordedTxn) {
        if self.records.len() == self.limit {
            self.records.pop_front();
        }
        self.records.push_back(txn);
    }

    pub fn records(&self) -> impl Iterator<Item = &RecordedTxn> {
        self.records.iter()
    }

    pub fn get(&self, seq: u64) -> Option<&RecordedTxn> {
        self.records.iter().find(|txn| txn.seq == seq)
    }

    pub fn last(&self) -> Option<&RecordedTxn> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64) -> RecordedTxn {
        RecordedTxn {
            seq,
            kind: TxnKind::Northbound,
            started: SystemTime::UNIX_EPOCH,
            finished: SystemTime::UNIX_EPOCH,
            ops: Vec::new(),
        }
    }

    #[test]
    fn keeps_only_the_most_recent_records() {
        let mut history = TxnHistory::new(2);
        history.record(record(1));
        history.record(record(2));
        history.record(record(3));

        assert_eq!(history.len(), 2);
        assert!(history.get(1).is_none());
        assert_eq!(history.get(2).unwrap().seq, 2);
        assert_eq!(history.last().unwrap().seq, 3);
    }
}
