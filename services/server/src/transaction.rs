// Transaction table: session-scoped bindings between the peer and one tool.
//
// Each transaction owns its replay window and its seq cursors: the highest
// inbound seq delivered (duplicates at or below it are dropped) and the next
// outbound seq the session will stamp on envelopes it emits for this
// transaction.

use crate::config::ServerConfig;
use crate::replay::ReplayWindow;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Started,
    Closed,
}

pub struct Transaction {
    pub id: String,
    pub status: TransactionStatus,
    pub tool_name: String,
    pub tool_params: Value,
    pub replay: ReplayWindow,
    pub last_delivered_seq: u64,
    next_outbound_seq: u64,
}

impl Transaction {
    pub fn next_outbound_seq(&mut self) -> u64 {
        let seq = self.next_outbound_seq;
        self.next_outbound_seq += 1;
        seq
    }
}

#[derive(Default)]
pub struct TransactionTable {
    transactions: HashMap<String, Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        TransactionTable::default()
    }

    /// Opens a transaction bound to `tool_name` under a fresh server-side id.
    pub fn open(&mut self, tool_name: &str, tool_params: Value, config: &ServerConfig) -> &Transaction {
        let id = uuid::Uuid::new_v4().to_string();
        let transaction = Transaction {
            id: id.clone(),
            status: TransactionStatus::Started,
            tool_name: tool_name.to_owned(),
            tool_params,
            replay: ReplayWindow::new(config.replay_window_time, config.replay_window_size),
            last_delivered_seq: 0,
            next_outbound_seq: 1,
        };
        self.transactions.insert(id.clone(), transaction);
        &self.transactions[&id]
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Transaction> {
        self.transactions.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transactions.contains_key(id)
    }

    /// Closes and removes a transaction.  Envelopes carrying the id after
    /// this point resolve to TRANSACTION_NOT_FOUND.
    pub fn close(&mut self, id: &str) -> Option<Transaction> {
        self.transactions.remove(id).map(|mut transaction| {
            transaction.status = TransactionStatus::Closed;
            transaction
        })
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// (transaction id, bound tool name) for every open transaction.  Used
    /// at teardown to fire cancellation hooks.
    pub fn open_bindings(&self) -> Vec<(String, String)> {
        self.transactions
            .values()
            .map(|t| (t.id.clone(), t.tool_name.clone()))
            .collect()
    }
}
