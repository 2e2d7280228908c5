//! File-backed integration state.
//!
//! One mutex guards the whole [`StoreSnapshot`]. Every mutation runs the
//! retention pass and rewrites the JSON file (temp file + rename) before the
//! lock is released, so callers never observe unflushed state.
//!
//! Mutations do file I/O under the lock. Async callers go through
//! [`IntegrationStore::blocking`] so the flush runs on the blocking pool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use relay_auth::{random_hex, Provider};
use tracing::{debug, info};

use crate::model::{
    ConnectionRecord, EventStatus, NewRawEvent, OAuthTicket, RawEventRecord, SetupConfig, Signal,
    StoreSnapshot,
};

const TICKET_BYTES: usize = 24;

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 200;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Clamp a caller-provided list limit: zero means the default, anything above the ceiling is capped.
pub fn normalize_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_LIST_LIMIT,
        n => n.min(MAX_LIST_LIMIT),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize integration state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("integration state lock poisoned")]
    Poisoned,
    #[error("blocking store task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_signals: usize,
    pub max_raw_events: usize,
    pub replay_retention: Duration,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_signals: 500,
            max_raw_events: 1000,
            replay_retention: Duration::hours(72),
        }
    }
}

pub struct IntegrationStore {
    path: PathBuf,
    limits: StoreLimits,
    clock: Clock,
    state: Mutex<StoreSnapshot>,
}

impl std::fmt::Debug for IntegrationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationStore")
            .field("path", &self.path)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl IntegrationStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with(path, StoreLimits::default(), system_clock())
    }

    /// Load the snapshot at `path`. A missing file is a first run and is
    /// written immediately; an unreadable document is an error.
    pub fn open_with(path: &Path, limits: StoreLimits, clock: Clock) -> Result<Self, StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let snapshot = match std::fs::read_to_string(path) {
            Ok(contents) if contents.trim().is_empty() => StoreSnapshot::default(),
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no integration state found, starting fresh");
                StoreSnapshot::default()
            }
            Err(err) => return Err(io_err(err)),
        };

        let store = Self {
            path: path.to_path_buf(),
            limits,
            clock,
            state: Mutex::new(snapshot),
        };
        {
            let mut guard = store.lock()?;
            let now = store.now();
            store.commit(&mut guard, now)?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreSnapshot>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Apply retention and flush. In-memory changes stay applied if the write fails.
    fn commit(&self, snapshot: &mut StoreSnapshot, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.cleanup(snapshot, now);
        self.persist(snapshot)
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreSnapshot, DateTime<Utc>) -> T,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock()?;
        let now = self.now();
        let out = f(&mut guard, now);
        self.commit(&mut guard, now)?;
        Ok(out)
    }

    /// Run a store call on the blocking pool. Must be called inside a Tokio runtime.
    pub async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&IntegrationStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn read<T>(&self, f: impl FnOnce(&StoreSnapshot) -> T) -> Result<T, StoreError> {
        let guard = self.lock()?;
        Ok(f(&guard))
    }

    fn cleanup(&self, snapshot: &mut StoreSnapshot, now: DateTime<Utc>) {
        snapshot.oauth_states.retain(|_, ticket| ticket.expires_at >= now);

        let horizon = now - self.limits.replay_retention;
        snapshot.seen_events.retain(|_, seen_at| *seen_at >= horizon);

        trim_front(&mut snapshot.raw_events, self.limits.max_raw_events);
        trim_front(&mut snapshot.signals, self.limits.max_signals);
    }

    fn persist(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        write_private(&tmp, &bytes).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    pub fn create_oauth_ticket(
        &self,
        provider: Provider,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        let token = random_hex(TICKET_BYTES);
        let key = token.clone();
        self.mutate(move |snapshot, now| {
            snapshot.oauth_states.insert(
                key,
                OAuthTicket {
                    provider,
                    expires_at: now + ttl,
                },
            );
        })?;
        Ok(token)
    }

    /// Single use: the ticket is removed whether or not it was valid.
    pub fn consume_oauth_ticket(&self, token: &str, expected: Provider) -> Result<bool, StoreError> {
        let mut guard = self.lock()?;
        let now = self.now();
        let valid = match guard.oauth_states.remove(token) {
            Some(ticket) => ticket.provider == expected && now <= ticket.expires_at,
            None => false,
        };
        self.commit(&mut guard, now)?;
        Ok(valid)
    }

    pub fn upsert_connection(&self, connection: ConnectionRecord) -> Result<(), StoreError> {
        self.mutate(move |snapshot, _| snapshot.connection = Some(connection))
    }

    pub fn get_connection(&self) -> Result<Option<ConnectionRecord>, StoreError> {
        self.read(|snapshot| snapshot.connection.clone())
    }

    /// Drops the connection together with the channel selection.
    pub fn disconnect_connection(&self) -> Result<(), StoreError> {
        self.mutate(|snapshot, _| {
            snapshot.connection = None;
            snapshot.selected_channels.clear();
        })
    }

    pub fn get_setup(&self) -> Result<Option<SetupConfig>, StoreError> {
        self.read(|snapshot| snapshot.setup.clone())
    }

    /// Stores an already merged setup. Blank secret fields keep the stored ciphertext.
    pub fn upsert_setup(&self, mut setup: SetupConfig) -> Result<(), StoreError> {
        self.mutate(move |snapshot, now| {
            if let Some(previous) = snapshot.setup.as_ref() {
                if setup.client_secret_enc.trim().is_empty() {
                    setup.client_secret_enc = previous.client_secret_enc.clone();
                }
                if setup.signing_secret_enc.trim().is_empty() {
                    setup.signing_secret_enc = previous.signing_secret_enc.clone();
                }
            }
            setup.updated_at = Some(now);
            snapshot.setup = Some(setup);
        })
    }

    pub fn get_selected_channels(&self) -> Result<Vec<String>, StoreError> {
        self.read(|snapshot| snapshot.selected_channels.clone())
    }

    pub fn set_selected_channels(&self, channels: Vec<String>) -> Result<(), StoreError> {
        self.mutate(move |snapshot, _| snapshot.selected_channels = channels)
    }

    /// Check-and-insert into the replay ledger. Returns `false` and leaves the
    /// store untouched when the id was already seen.
    pub fn record_event(&self, event: NewRawEvent) -> Result<bool, StoreError> {
        let mut guard = self.lock()?;
        let now = self.now();
        let horizon = now - self.limits.replay_retention;

        if guard
            .seen_events
            .get(&event.event_id)
            .is_some_and(|seen_at| *seen_at >= horizon)
        {
            debug!(event_id = %event.event_id, "duplicate event delivery");
            return Ok(false);
        }

        guard.seen_events.insert(event.event_id.clone(), now);
        guard.raw_events.push(RawEventRecord {
            event_id: event.event_id,
            team_id: event.team_id,
            event_type: event.event_type,
            event_time: event.event_time,
            payload: event.payload,
            received_at: now,
            status: EventStatus::Pending,
            error: None,
        });
        self.commit(&mut guard, now)?;
        Ok(true)
    }

    /// Update the newest audit record carrying `event_id`. Returns `false` if none matched.
    pub fn update_event_status(
        &self,
        event_id: &str,
        status: EventStatus,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.lock()?;
        let now = self.now();
        let Some(record) = guard
            .raw_events
            .iter_mut()
            .rev()
            .find(|record| record.event_id == event_id)
        else {
            return Ok(false);
        };
        record.status = status;
        record.error = error.filter(|e| !e.trim().is_empty());
        self.commit(&mut guard, now)?;
        Ok(true)
    }

    pub fn upsert_signal(&self, signal: Signal) -> Result<(), StoreError> {
        self.mutate(move |snapshot, _| {
            match snapshot.signals.iter_mut().find(|s| s.id == signal.id) {
                Some(existing) => *existing = signal,
                None => snapshot.signals.push(signal),
            }
        })
    }

    /// Newest first, optionally filtered by source (case-insensitive).
    pub fn list_signals(&self, source: Option<&str>, limit: usize) -> Result<Vec<Signal>, StoreError> {
        let limit = normalize_limit(limit);
        let source = source.map(str::trim).filter(|s| !s.is_empty());
        self.read(|snapshot| {
            snapshot
                .signals
                .iter()
                .rev()
                .filter(|signal| source.map_or(true, |src| signal.source.eq_ignore_ascii_case(src)))
                .take(limit)
                .cloned()
                .collect()
        })
    }

    pub fn raw_event_count(&self) -> Result<usize, StoreError> {
        self.read(|snapshot| snapshot.raw_events.len())
    }

    /// Newest first.
    pub fn recent_raw_events(&self, limit: usize) -> Result<Vec<RawEventRecord>, StoreError> {
        self.read(|snapshot| snapshot.raw_events.iter().rev().take(limit).cloned().collect())
    }
}

fn trim_front<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::value::RawValue;
    use tempfile::TempDir;

    struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

    impl ManualClock {
        fn new() -> Self {
            let start = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc);
            Self(Arc::new(Mutex::new(start)))
        }

        fn clock(&self) -> Clock {
            let inner = self.0.clone();
            Arc::new(move || *inner.lock().unwrap())
        }

        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    fn open(dir: &TempDir, limits: StoreLimits, clock: &ManualClock) -> IntegrationStore {
        IntegrationStore::open_with(&dir.path().join("state.json"), limits, clock.clock()).unwrap()
    }

    fn raw_event(id: &str) -> NewRawEvent {
        NewRawEvent {
            event_id: id.to_string(),
            team_id: "T1".to_string(),
            event_type: "message".to_string(),
            event_time: 1_714_564_800,
            payload: RawValue::from_string(format!(r#"{{"event_id":"{}"}}"#, id)).unwrap(),
        }
    }

    fn signal(id: &str, source: &str) -> Signal {
        Signal {
            id: id.to_string(),
            source: source.to_string(),
            title: format!("title {}", id),
            summary: "summary".to_string(),
            occurred_at: Utc::now(),
            meta: Default::default(),
        }
    }

    #[test]
    fn test_missing_file_is_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = IntegrationStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.get_connection().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_fails_to_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = IntegrationStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = IntegrationStore::open(&path).unwrap();
            store
                .set_selected_channels(vec!["C1".into(), "C2".into()])
                .unwrap();
            store.upsert_signal(signal("s1", "Slack")).unwrap();
        }
        let store = IntegrationStore::open(&path).unwrap();
        assert_eq!(store.get_selected_channels().unwrap(), vec!["C1", "C2"]);
        assert_eq!(store.list_signals(None, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_record_event_dedups() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);

        assert!(store.record_event(raw_event("E1")).unwrap());
        assert!(!store.record_event(raw_event("E1")).unwrap());
        assert_eq!(store.raw_event_count().unwrap(), 1);

        let events = store.recent_raw_events(10).unwrap();
        assert_eq!(events[0].status, EventStatus::Pending);
        assert_eq!(events[0].payload.get(), r#"{"event_id":"E1"}"#);
    }

    #[test]
    fn test_replay_ledger_expires_after_retention() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);

        assert!(store.record_event(raw_event("E1")).unwrap());
        clock.advance(Duration::hours(73));
        assert!(store.record_event(raw_event("E1")).unwrap());
    }

    #[test]
    fn test_ticket_is_single_use() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);

        let token = store
            .create_oauth_ticket(Provider::Slack, Duration::minutes(10))
            .unwrap();
        assert_eq!(token.len(), TICKET_BYTES * 2);
        assert!(store.consume_oauth_ticket(&token, Provider::Slack).unwrap());
        assert!(!store.consume_oauth_ticket(&token, Provider::Slack).unwrap());
    }

    #[test]
    fn test_expired_ticket_is_rejected() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);

        let token = store
            .create_oauth_ticket(Provider::Slack, Duration::minutes(10))
            .unwrap();
        clock.advance(Duration::minutes(11));
        assert!(!store.consume_oauth_ticket(&token, Provider::Slack).unwrap());
    }

    #[test]
    fn test_unknown_ticket_is_rejected() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);
        assert!(!store.consume_oauth_ticket("nope", Provider::Slack).unwrap());
    }

    #[test]
    fn test_signal_cap_evicts_oldest() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let limits = StoreLimits {
            max_signals: 3,
            ..StoreLimits::default()
        };
        let store = open(&dir, limits, &clock);

        for i in 0..5 {
            store.upsert_signal(signal(&format!("s{}", i), "Slack")).unwrap();
        }
        let ids: Vec<_> = store
            .list_signals(None, 0)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["s4", "s3", "s2"]);
    }

    #[test]
    fn test_raw_event_cap_evicts_oldest() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let limits = StoreLimits {
            max_raw_events: 2,
            ..StoreLimits::default()
        };
        let store = open(&dir, limits, &clock);
        for id in ["E1", "E2", "E3"] {
            store.record_event(raw_event(id)).unwrap();
        }
        let ids: Vec<_> = store
            .recent_raw_events(10)
            .unwrap()
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ids, vec!["E3", "E2"]);
    }

    #[test]
    fn test_upsert_signal_replaces_by_id() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);

        store.upsert_signal(signal("s1", "Slack")).unwrap();
        let mut updated = signal("s1", "Slack");
        updated.summary = "edited".to_string();
        store.upsert_signal(updated).unwrap();

        let signals = store.list_signals(None, 0).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].summary, "edited");
    }

    #[test]
    fn test_list_signals_filters_source_case_insensitively() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);

        store.upsert_signal(signal("a", "Slack")).unwrap();
        store.upsert_signal(signal("b", "GitHub")).unwrap();
        store.upsert_signal(signal("c", "slack")).unwrap();

        let ids: Vec<_> = store
            .list_signals(Some("SLACK"), 0)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(store.list_signals(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_normalize_limit() {
        assert_eq!(normalize_limit(0), DEFAULT_LIST_LIMIT);
        assert_eq!(normalize_limit(5), 5);
        assert_eq!(normalize_limit(10_000), MAX_LIST_LIMIT);
    }

    #[test]
    fn test_update_event_status_targets_newest_record() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);

        store.record_event(raw_event("E1")).unwrap();
        assert!(store
            .update_event_status("E1", EventStatus::Ignored, Some("bot message".into()))
            .unwrap());
        assert!(!store
            .update_event_status("missing", EventStatus::Failed, None)
            .unwrap());

        let events = store.recent_raw_events(1).unwrap();
        assert_eq!(events[0].status, EventStatus::Ignored);
        assert_eq!(events[0].error.as_deref(), Some("bot message"));
    }

    #[test]
    fn test_disconnect_clears_selection() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);

        store
            .upsert_connection(ConnectionRecord {
                team_id: "T1".into(),
                team_name: "Acme".into(),
                bot_user_id: "B1".into(),
                scope: "channels:read".into(),
                access_token_enc: "sealed".into(),
                connected_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .unwrap();
        store.set_selected_channels(vec!["C1".into()]).unwrap();

        store.disconnect_connection().unwrap();
        assert!(store.get_connection().unwrap().is_none());
        assert!(store.get_selected_channels().unwrap().is_empty());
    }

    #[test]
    fn test_upsert_setup_preserves_blank_secrets() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);

        store
            .upsert_setup(SetupConfig {
                client_id: "id".into(),
                client_secret_enc: "sealed-secret".into(),
                signing_secret_enc: "sealed-signing".into(),
                ..SetupConfig::default()
            })
            .unwrap();
        store
            .upsert_setup(SetupConfig {
                client_id: "id2".into(),
                ..SetupConfig::default()
            })
            .unwrap();

        let setup = store.get_setup().unwrap().unwrap();
        assert_eq!(setup.client_id, "id2");
        assert_eq!(setup.client_secret_enc, "sealed-secret");
        assert_eq!(setup.signing_secret_enc, "sealed-signing");
        assert!(setup.updated_at.is_some());
    }

    #[test]
    fn test_upsert_setup_stamps_current_time() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);
        let stale = clock.clock()() - Duration::days(30);

        clock.advance(Duration::minutes(5));
        store
            .upsert_setup(SetupConfig {
                client_id: "id".into(),
                updated_at: Some(stale),
                ..SetupConfig::default()
            })
            .unwrap();

        let setup = store.get_setup().unwrap().unwrap();
        assert_eq!(setup.updated_at, Some(clock.clock()()));
    }

    #[test]
    fn test_duplicate_delivery_keeps_memory_and_file_in_step() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = open(&dir, StoreLimits::default(), &clock);

        store
            .create_oauth_ticket(Provider::Slack, Duration::minutes(1))
            .unwrap();
        assert!(store.record_event(raw_event("E1")).unwrap());
        let on_disk = std::fs::read(store.path()).unwrap();

        clock.advance(Duration::minutes(2));
        assert!(!store.record_event(raw_event("E1")).unwrap());

        let in_memory = store.read(|snapshot| serde_json::to_vec_pretty(snapshot).unwrap()).unwrap();
        assert_eq!(std::fs::read(store.path()).unwrap(), on_disk);
        assert_eq!(in_memory, on_disk);
    }

    #[tokio::test]
    async fn test_blocking_call_is_flushed_on_return() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = Arc::new(IntegrationStore::open(&path).unwrap());

        store
            .blocking(|store| store.set_selected_channels(vec!["C9".into()]))
            .await
            .unwrap();

        let reopened = IntegrationStore::open(&path).unwrap();
        assert_eq!(reopened.get_selected_channels().unwrap(), vec!["C9"]);
    }
}
