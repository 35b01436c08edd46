// SPDX-License-Identifier: Apache-2.0

//! Downstream channel interface.
//!
//! The source hands records to a transactional batch sink. Calls always
//! follow the order `begin → put* → (commit | rollback) → close`; on commit
//! the batch is durably accepted, on rollback none of it is.
//!
//! [`MemoryChannel`] is a small in-process implementation used by the test
//! suite and by embedders that drain records from the same process.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::record::Record;

/// A single batch transaction against a channel.
pub trait Transaction {
    fn begin(&mut self);

    /// Stage a record into the transaction
    fn put(&mut self, record: Record) -> Result<()>;

    /// Atomically accept every staged record
    fn commit(&mut self) -> Result<()>;

    /// Discard every staged record
    fn rollback(&mut self);

    fn close(&mut self);
}

/// A transactional batch sink for records.
pub trait Channel {
    type Txn: Transaction;

    /// Open a new transaction against this channel
    fn transaction(&self) -> Self::Txn;
}

/// In-memory channel backed by a shared queue.
///
/// Cloning yields another handle onto the same queue. A capacity bound makes
/// `commit` fail when the queue would overflow, which is how tests exercise
/// the rollback path.
#[derive(Clone)]
pub struct MemoryChannel {
    queue: Arc<Mutex<VecDeque<Record>>>,
    capacity: Option<usize>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            capacity: None,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            capacity: Some(capacity),
        }
    }

    /// Pop the oldest committed record, if any
    pub fn take(&self) -> Option<Record> {
        self.queue.lock().ok()?.pop_front()
    }

    /// Drain every committed record
    pub fn drain(&self) -> Vec<Record> {
        match self.queue.lock() {
            Ok(mut q) => q.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MemoryChannel {
    type Txn = MemoryTransaction;

    fn transaction(&self) -> MemoryTransaction {
        MemoryTransaction {
            queue: self.queue.clone(),
            capacity: self.capacity,
            staged: Vec::new(),
        }
    }
}

pub struct MemoryTransaction {
    queue: Arc<Mutex<VecDeque<Record>>>,
    capacity: Option<usize>,
    staged: Vec<Record>,
}

impl Transaction for MemoryTransaction {
    fn begin(&mut self) {
        self.staged.clear();
    }

    fn put(&mut self, record: Record) -> Result<()> {
        self.staged.push(record);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|e| Error::Channel(e.to_string()))?;

        if let Some(capacity) = self.capacity {
            if queue.len() + self.staged.len() > capacity {
                return Err(Error::Channel(format!(
                    "channel full: {} queued, {} staged, capacity {}",
                    queue.len(),
                    self.staged.len(),
                    capacity
                )));
            }
        }

        queue.extend(self.staged.drain(..));
        Ok(())
    }

    fn rollback(&mut self) {
        self.staged.clear();
    }

    fn close(&mut self) {
        self.staged.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_delivers_in_order() {
        let channel = MemoryChannel::new();
        let mut txn = channel.transaction();
        txn.begin();
        txn.put(Record::with_body(b"a".to_vec())).unwrap();
        txn.put(Record::with_body(b"b".to_vec())).unwrap();
        txn.commit().unwrap();
        txn.close();

        assert_eq!(channel.take().unwrap().body(), b"a");
        assert_eq!(channel.take().unwrap().body(), b"b");
        assert!(channel.take().is_none());
    }

    #[test]
    fn test_rollback_discards() {
        let channel = MemoryChannel::new();
        let mut txn = channel.transaction();
        txn.begin();
        txn.put(Record::with_body(b"a".to_vec())).unwrap();
        txn.rollback();
        txn.close();

        assert!(channel.is_empty());
    }

    #[test]
    fn test_commit_fails_when_full() {
        let channel = MemoryChannel::with_capacity(1);
        let mut txn = channel.transaction();
        txn.begin();
        txn.put(Record::with_body(b"a".to_vec())).unwrap();
        txn.put(Record::with_body(b"b".to_vec())).unwrap();
        assert!(txn.commit().is_err());
        txn.rollback();
        txn.close();

        assert!(channel.is_empty());
    }
}
