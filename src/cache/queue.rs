//! Transaction Queue Module
//!
//! Operations captured by the cache engine, executed in submission order
//! once storage is ready.

use std::collections::{BTreeMap, VecDeque};

use tokio::sync::oneshot;

use crate::cache::{CacheEntry, FindQuery};
use crate::error::Result;
use crate::storage::{CacheRow, TxScope};

// == Operations ==
/// A unit of work against the storage backend.
#[derive(Debug, Clone)]
pub(crate) enum Operation {
    Find { table: String, query: FindQuery },
    Save { table: String, rows: Vec<CacheRow> },
    Delete { table: String, query: FindQuery },
    /// `gated` prunes only run when the configured interval has elapsed
    Prune { tables: Option<Vec<String>>, gated: bool },
}

impl Operation {
    pub(crate) fn scope(&self) -> TxScope {
        match self {
            Operation::Find { .. } => TxScope::Read,
            _ => TxScope::ReadWrite,
        }
    }

    pub(crate) fn is_read(&self) -> bool {
        matches!(self, Operation::Find { .. })
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Operation::Find { .. } => "find",
            Operation::Save { .. } => "save",
            Operation::Delete { .. } => "delete",
            Operation::Prune { .. } => "prune",
        }
    }
}

/// Result of an executed operation.
#[derive(Debug)]
pub(crate) enum OpOutput {
    Entries(Vec<CacheEntry>),
    Saved(usize),
    Deleted(usize),
    Pruned(BTreeMap<String, usize>),
}

// == Queue Item ==
/// A captured operation waiting for execution.
#[derive(Debug)]
pub(crate) struct QueuedOp {
    pub scope: TxScope,
    pub tables: Vec<String>,
    pub op: Operation,
    /// Requeues caused by tables missing from the opened schema
    pub attempts: u32,
    pub reply: oneshot::Sender<Result<OpOutput>>,
}

impl QueuedOp {
    pub(crate) fn new(op: Operation, tables: Vec<String>) -> (Self, oneshot::Receiver<Result<OpOutput>>) {
        let (reply, rx) = oneshot::channel();
        let item = Self {
            scope: op.scope(),
            tables,
            op,
            attempts: 0,
            reply,
        };
        (item, rx)
    }

    /// Resolves the waiting caller. A caller that gave up is ignored.
    pub(crate) fn resolve(self, result: Result<OpOutput>) {
        let _ = self.reply.send(result);
    }
}

// == Transaction Queue ==
/// FIFO of captured operations with front-run support.
#[derive(Debug, Default)]
pub(crate) struct TransactionQueue {
    items: VecDeque<QueuedOp>,
}

impl TransactionQueue {
    pub(crate) fn push(&mut self, item: QueuedOp) {
        self.items.push_back(item);
    }

    /// Places `item` ahead of everything not yet executed.
    pub(crate) fn front_run(&mut self, item: QueuedOp) {
        self.items.push_front(item);
    }

    /// Takes every queued item, leaving the queue empty.
    pub(crate) fn take_all(&mut self) -> VecDeque<QueuedOp> {
        std::mem::take(&mut self.items)
    }

    /// Puts `items` back ahead of anything queued since they were taken.
    pub(crate) fn restore_front(&mut self, items: impl DoubleEndedIterator<Item = QueuedOp>) {
        for item in items.rev() {
            self.items.push_front(item);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
