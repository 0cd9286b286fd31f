use crate::broker::MessageSource;
use crate::error::{BrokerError, StoreError};
use crate::store::{history_key, last_state_key, StoreCommand, TelemetryStore};
use crate::supervisor::Connector;
use crate::telemetry::Polled;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    Write { history_entries: usize },
    Commit(Vec<(i32, i64)>),
}

/// Ordered log of side effects shared by the broker and store doubles.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    pub fn push(&self, entry: JournalEntry) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    zsets: HashMap<String, HashMap<String, f64>>,
    hashes: HashMap<String, HashMap<String, String>>,
    published: Vec<(String, String)>,
    failures: VecDeque<StoreError>,
    journal: Option<Journal>,
}

impl MemoryState {
    fn apply(&mut self, command: &StoreCommand) {
        match command {
            StoreCommand::HistoryAdd { key, member, score } => {
                self.zsets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone(), *score);
            }
            StoreCommand::LastStateSet { key, fields } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
            }
            StoreCommand::Publish { channel, message } => {
                self.published.push((channel.clone(), message.clone()));
            }
            StoreCommand::PruneBefore { key, cutoff } => {
                if let Some(zset) = self.zsets.get_mut(key) {
                    zset.retain(|_, score| *score > *cutoff as f64);
                }
            }
        }
    }
}

/// In-process stand-in for the Redis store with all-or-nothing transactions.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        let store = Self::new();
        store.inner.lock().unwrap().journal = Some(journal);
        store
    }

    pub fn fail_next(&self, err: StoreError) {
        self.inner.lock().unwrap().failures.push_back(err);
    }

    /// History members ordered by score.
    pub fn history_members(&self, device_id: &str) -> Vec<String> {
        self.sorted_history(device_id)
            .into_iter()
            .map(|(member, _)| member)
            .collect()
    }

    pub fn history_scores(&self, device_id: &str) -> Vec<f64> {
        self.sorted_history(device_id)
            .into_iter()
            .map(|(_, score)| score)
            .collect()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().published.clone()
    }

    fn sorted_history(&self, device_id: &str) -> Vec<(String, f64)> {
        let state = self.inner.lock().unwrap();
        let mut entries: Vec<(String, f64)> = state
            .zsets
            .get(&history_key(device_id))
            .map(|zset| zset.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }
}

impl TelemetryStore for MemoryStore {
    async fn ping(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn execute_atomic(&mut self, commands: &[StoreCommand]) -> Result<(), StoreError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        for command in commands {
            state.apply(command);
        }
        let history_entries = commands
            .iter()
            .filter(|command| matches!(command, StoreCommand::HistoryAdd { .. }))
            .count();
        if let Some(journal) = &state.journal {
            journal.push(JournalEntry::Write { history_entries });
        }
        Ok(())
    }

    async fn history_range(
        &mut self,
        device_id: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sorted_history(device_id)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(member, _)| member)
            .collect())
    }

    async fn last_state(&mut self, device_id: &str) -> Result<HashMap<String, String>, StoreError> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .hashes
            .get(&last_state_key(device_id))
            .cloned()
            .unwrap_or_default())
    }
}

pub struct MemoryConnector {
    store: MemoryStore,
    connect_failures: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            connect_failures: AtomicUsize::new(0),
        }
    }

    pub fn failing(store: MemoryStore, connect_failures: usize) -> Self {
        Self {
            store,
            connect_failures: AtomicUsize::new(connect_failures),
        }
    }
}

impl Connector for MemoryConnector {
    type Handle = MemoryStore;
    type Error = StoreError;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<MemoryStore, StoreError> {
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Connection("connection refused".to_string()));
        }
        Ok(self.store.clone())
    }

    async fn probe(&self, handle: &mut MemoryStore) -> Result<(), StoreError> {
        handle.ping().await
    }
}

#[derive(Debug, Default)]
struct BrokerScript {
    polls: VecDeque<Result<Vec<Polled>, BrokerError>>,
    commit_failures: VecDeque<BrokerError>,
    committed: BTreeMap<i32, i64>,
    connects: usize,
    journal: Option<Journal>,
}

/// Broker double that replays scripted poll results and records commits.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBroker {
    inner: Arc<Mutex<BrokerScript>>,
}

impl ScriptedBroker {
    pub fn with_journal(journal: Journal) -> Self {
        let broker = Self::default();
        broker.inner.lock().unwrap().journal = Some(journal);
        broker
    }

    pub fn push_poll(&self, polled: Vec<Polled>) {
        self.inner.lock().unwrap().polls.push_back(Ok(polled));
    }

    pub fn push_poll_error(&self, err: BrokerError) {
        self.inner.lock().unwrap().polls.push_back(Err(err));
    }

    pub fn fail_next_commit(&self, err: BrokerError) {
        self.inner.lock().unwrap().commit_failures.push_back(err);
    }

    pub fn connects(&self) -> usize {
        self.inner.lock().unwrap().connects
    }

    /// Next offset to consume per partition, as committed so far.
    pub fn committed(&self) -> BTreeMap<i32, i64> {
        self.inner.lock().unwrap().committed.clone()
    }
}

impl MessageSource for ScriptedBroker {
    async fn poll(
        &mut self,
        _timeout: Duration,
        _max_records: usize,
    ) -> Result<Vec<Polled>, BrokerError> {
        self.inner
            .lock()
            .unwrap()
            .polls
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn commit(&mut self, offsets: &[(i32, i64)]) -> Result<(), BrokerError> {
        let mut script = self.inner.lock().unwrap();
        if let Some(err) = script.commit_failures.pop_front() {
            return Err(err);
        }
        for &(partition, next) in offsets {
            script.committed.insert(partition, next);
        }
        if let Some(journal) = &script.journal {
            journal.push(JournalEntry::Commit(offsets.to_vec()));
        }
        Ok(())
    }
}

pub struct ScriptedConnector {
    broker: ScriptedBroker,
}

impl ScriptedConnector {
    pub fn new(broker: ScriptedBroker) -> Self {
        Self { broker }
    }
}

impl Connector for ScriptedConnector {
    type Handle = ScriptedBroker;
    type Error = BrokerError;

    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self) -> Result<ScriptedBroker, BrokerError> {
        self.broker.inner.lock().unwrap().connects += 1;
        Ok(self.broker.clone())
    }

    async fn probe(&self, _handle: &mut ScriptedBroker) -> Result<(), BrokerError> {
        Ok(())
    }
}
