//! Scriptable [`SourceAdapter`] for orchestrator scenario tests.
//!
//! Per-account behavior is scripted up front. When the source is backed by a
//! [`MemStore`], a scripted success actually writes the snapshot, so a second
//! run over the same roster naturally reports duplicates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use arx_db::store::{SnapshotStore, StoreError};
use arx_schemas::invoice_number;
use arx_source::{AcceptReceipt, SourceAdapter, SourceError};

use crate::{sample_snapshot, MemStore};

/// Scripted per-account behavior. Accounts without a script succeed.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed,
    AlreadyArchived,
    ComputeFailed(String),
    TransportFailed(String),
}

pub struct ScriptedSource {
    roster: Mutex<Result<Vec<String>, String>>,
    scripts: Mutex<HashMap<String, ScriptedOutcome>>,
    delays: Mutex<HashMap<String, Duration>>,
    store: Option<Arc<MemStore>>,
    compute_calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(roster: Vec<&str>) -> Self {
        Self {
            roster: Mutex::new(Ok(roster.into_iter().map(String::from).collect())),
            scripts: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            store: None,
            compute_calls: AtomicUsize::new(0),
        }
    }

    /// Roster resolution itself fails; every run against this source aborts.
    pub fn roster_down(message: &str) -> Self {
        Self {
            roster: Mutex::new(Err(message.to_string())),
            scripts: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            store: None,
            compute_calls: AtomicUsize::new(0),
        }
    }

    /// Back scripted successes with a real repository write.
    pub fn backed_by(mut self, store: Arc<MemStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn on_account(self, account: &str, outcome: ScriptedOutcome) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(account.to_string(), outcome);
        self
    }

    /// Delay this account's attempt, to exercise out-of-order completion
    /// under parallel execution.
    pub fn with_delay(self, account: &str, delay: Duration) -> Self {
        self.delays
            .lock()
            .unwrap()
            .insert(account.to_string(), delay);
        self
    }

    /// Number of `compute_and_accept` calls observed so far.
    pub fn compute_calls(&self) -> usize {
        self.compute_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn list_billable_accounts(&self) -> Result<Vec<String>, SourceError> {
        match &*self.roster.lock().unwrap() {
            Ok(roster) => Ok(roster.clone()),
            Err(msg) => Err(SourceError::RosterUnavailable(msg.clone())),
        }
    }

    async fn compute_and_accept(
        &self,
        account: &str,
        year: i32,
        month: i32,
    ) -> Result<AcceptReceipt, SourceError> {
        self.compute_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(account).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(account)
            .cloned()
            .unwrap_or(ScriptedOutcome::Succeed);

        let invoice = invoice_number(account, year, month);
        match script {
            ScriptedOutcome::Succeed => {
                if let Some(store) = &self.store {
                    match store.put(sample_snapshot(account, year, month)).await {
                        Ok(_) => {}
                        Err(StoreError::Duplicate { invoice_number }) => {
                            return Err(SourceError::Duplicate { invoice_number });
                        }
                        Err(e) => return Err(SourceError::ComputeFailed(e.to_string())),
                    }
                }
                Ok(AcceptReceipt {
                    invoice_number: invoice,
                })
            }
            ScriptedOutcome::AlreadyArchived => Err(SourceError::Duplicate {
                invoice_number: invoice,
            }),
            ScriptedOutcome::ComputeFailed(msg) => Err(SourceError::ComputeFailed(msg)),
            ScriptedOutcome::TransportFailed(msg) => Err(SourceError::Transport(msg)),
        }
    }
}
