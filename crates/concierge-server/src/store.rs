use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use concierge_contracts::{
    AssistantRequest, AutonomyMode, AutonomyRule, AutonomyScope, CoachingProfile, Contact,
    ConversationState, ConversationThread, Digest, Direction, Habit, HabitLog, HabitNudge,
    MemoryFact, ProactiveEvent, RequestEvent, StoredMessage, SystemConfig, Task, ThreadStatus,
    ToolRun,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

const SINGLETON: &str = "singleton";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    States,
    AutonomyRules,
    Contacts,
    Threads,
    Requests,
    RequestEvents,
    ProactiveEvents,
    Digests,
    Habits,
    HabitLogs,
    HabitNudges,
    CoachingProfile,
    Facts,
    Messages,
    Tasks,
    SystemConfig,
}

impl Collection {
    const ALL: [Collection; 16] = [
        Collection::States,
        Collection::AutonomyRules,
        Collection::Contacts,
        Collection::Threads,
        Collection::Requests,
        Collection::RequestEvents,
        Collection::ProactiveEvents,
        Collection::Digests,
        Collection::Habits,
        Collection::HabitLogs,
        Collection::HabitNudges,
        Collection::CoachingProfile,
        Collection::Facts,
        Collection::Messages,
        Collection::Tasks,
        Collection::SystemConfig,
    ];

    fn table(self) -> &'static str {
        match self {
            Collection::States => "conversation_states",
            Collection::AutonomyRules => "autonomy_rules",
            Collection::Contacts => "contacts",
            Collection::Threads => "conversation_threads",
            Collection::Requests => "assistant_requests",
            Collection::RequestEvents => "assistant_request_events",
            Collection::ProactiveEvents => "proactive_events",
            Collection::Digests => "digests",
            Collection::Habits => "habits",
            Collection::HabitLogs => "habit_logs",
            Collection::HabitNudges => "habit_nudges",
            Collection::CoachingProfile => "coaching_profile",
            Collection::Facts => "memory_facts",
            Collection::Messages => "messages_raw",
            Collection::Tasks => "tasks",
            Collection::SystemConfig => "system_config",
        }
    }
}

fn enum_label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

fn id_key(id: i64) -> String {
    format!("{id:012}")
}

#[derive(Default)]
pub struct MemoryStore {
    docs: HashMap<Collection, BTreeMap<String, String>>,
    counters: HashMap<Collection, i64>,
    tool_runs: Vec<ToolRun>,
}

pub struct SqliteStore {
    conn: Connection,
}

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub fn open(kind: &str, sqlite_path: Option<&str>) -> Result<Self, String> {
        if kind == "sqlite" {
            let path =
                sqlite_path.ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            Ok(StoreBackend::Sqlite(SqliteStore::new(path)?))
        } else {
            Ok(StoreBackend::Memory(MemoryStore::default()))
        }
    }

    fn put_raw(&mut self, c: Collection, key: &str, body: String) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store.docs.entry(c).or_default().insert(key.to_string(), body);
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put(c, key, &body),
        }
    }

    fn put<T: Serialize>(&mut self, c: Collection, key: &str, value: &T) -> Result<(), String> {
        let body = serde_json::to_string(value).map_err(|e| e.to_string())?;
        self.put_raw(c, key, body)
    }

    fn get<T: DeserializeOwned>(&self, c: Collection, key: &str) -> Result<Option<T>, String> {
        let body = match self {
            StoreBackend::Memory(store) => store.docs.get(&c).and_then(|m| m.get(key)).cloned(),
            StoreBackend::Sqlite(store) => store.get(c, key)?,
        };
        match body {
            Some(v) => serde_json::from_str(&v).map(Some).map_err(|e| e.to_string()),
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, c: Collection) -> Result<Vec<T>, String> {
        let bodies = match self {
            StoreBackend::Memory(store) => store
                .docs
                .get(&c)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default(),
            StoreBackend::Sqlite(store) => store.list(c)?,
        };
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(|e| e.to_string()))
            .collect()
    }

    /// Inserts only when `key` is new; returns whether a row was written.
    fn insert_new<T: Serialize>(&mut self, c: Collection, key: &str, value: &T) -> Result<bool, String> {
        let body = serde_json::to_string(value).map_err(|e| e.to_string())?;
        match self {
            StoreBackend::Memory(store) => {
                let docs = store.docs.entry(c).or_default();
                if docs.contains_key(key) {
                    return Ok(false);
                }
                docs.insert(key.to_string(), body);
                Ok(true)
            }
            StoreBackend::Sqlite(store) => store.insert_new(c, key, &body),
        }
    }

    fn next_id(&mut self, c: Collection) -> Result<i64, String> {
        match self {
            StoreBackend::Memory(store) => {
                let counter = store.counters.entry(c).or_insert(0);
                *counter += 1;
                Ok(*counter)
            }
            StoreBackend::Sqlite(store) => store.next_id(c),
        }
    }

    pub fn state(&self, chat_id: &str) -> Result<ConversationState, String> {
        Ok(self
            .get(Collection::States, chat_id)?
            .unwrap_or_else(|| ConversationState::new(chat_id)))
    }

    pub fn save_state(&mut self, state: &ConversationState) -> Result<(), String> {
        self.put(Collection::States, &state.chat_id, state)
    }

    pub fn autonomy_rules(&self) -> Result<Vec<AutonomyRule>, String> {
        self.list(Collection::AutonomyRules)
    }

    pub fn add_autonomy_rule(
        &mut self,
        scope: AutonomyScope,
        mode: AutonomyMode,
        until_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<AutonomyRule, String> {
        let rule = AutonomyRule {
            id: self.next_id(Collection::AutonomyRules)?,
            scope,
            mode,
            until_at,
            created_at: now,
        };
        self.put(Collection::AutonomyRules, &id_key(rule.id), &rule)?;
        Ok(rule)
    }

    pub fn contact(&self, chat_id: &str) -> Result<Option<Contact>, String> {
        self.get(Collection::Contacts, chat_id)
    }

    pub fn contacts(&self) -> Result<Vec<Contact>, String> {
        self.list(Collection::Contacts)
    }

    pub fn save_contact(&mut self, contact: &Contact) -> Result<(), String> {
        self.put(Collection::Contacts, &contact.chat_id, contact)
    }

    pub fn threads(&self) -> Result<Vec<ConversationThread>, String> {
        self.list(Collection::Threads)
    }

    pub fn thread(&self, id: i64) -> Result<Option<ConversationThread>, String> {
        self.get(Collection::Threads, &id_key(id))
    }

    /// Latest thread with the contact that is not closed.
    pub fn active_thread(&self, chat_id: &str) -> Result<Option<ConversationThread>, String> {
        Ok(self
            .threads()?
            .into_iter()
            .filter(|t| t.contact_chat_id == chat_id && t.status != ThreadStatus::Closed)
            .max_by_key(|t| t.id))
    }

    pub fn open_thread(&mut self, chat_id: &str, now: DateTime<Utc>) -> Result<ConversationThread, String> {
        let thread = ConversationThread {
            id: self.next_id(Collection::Threads)?,
            contact_chat_id: chat_id.to_string(),
            status: ThreadStatus::Open,
            last_message_at: None,
            last_summary: None,
            updated_at: now,
        };
        self.save_thread(&thread)?;
        Ok(thread)
    }

    pub fn save_thread(&mut self, thread: &ConversationThread) -> Result<(), String> {
        self.put(Collection::Threads, &id_key(thread.id), thread)
    }

    pub fn requests(&self) -> Result<Vec<AssistantRequest>, String> {
        self.list(Collection::Requests)
    }

    pub fn request(&self, id: i64) -> Result<Option<AssistantRequest>, String> {
        self.get(Collection::Requests, &id_key(id))
    }

    pub fn request_by_dedupe(&self, dedupe_key: &str) -> Result<Option<AssistantRequest>, String> {
        Ok(self
            .requests()?
            .into_iter()
            .find(|r| r.dedupe_key == dedupe_key))
    }

    pub fn next_request_id(&mut self) -> Result<i64, String> {
        self.next_id(Collection::Requests)
    }

    pub fn save_request(&mut self, request: &AssistantRequest) -> Result<(), String> {
        self.put(Collection::Requests, &id_key(request.id), request)
    }

    pub fn add_request_event(
        &mut self,
        request_id: i64,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let id = self.next_id(Collection::RequestEvents)?;
        let event = RequestEvent {
            request_id,
            event_type: event_type.to_string(),
            created_at: now,
        };
        self.put(Collection::RequestEvents, &id_key(id), &event)
    }

    pub fn request_events(&self) -> Result<Vec<RequestEvent>, String> {
        self.list(Collection::RequestEvents)
    }

    pub fn has_proactive_event(&self, dedupe_key: &str) -> Result<bool, String> {
        Ok(self
            .get::<ProactiveEvent>(Collection::ProactiveEvents, dedupe_key)?
            .is_some())
    }

    /// Returns false when an event with the same dedupe key already exists.
    pub fn insert_proactive_event(&mut self, event: &ProactiveEvent) -> Result<bool, String> {
        self.insert_new(Collection::ProactiveEvents, &event.dedupe_key, event)
    }

    pub fn proactive_events(&self) -> Result<Vec<ProactiveEvent>, String> {
        let mut events: Vec<ProactiveEvent> = self.list(Collection::ProactiveEvents)?;
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    pub fn digest(&self, date: NaiveDate) -> Result<Option<Digest>, String> {
        self.get(Collection::Digests, &date.to_string())
    }

    pub fn save_digest(&mut self, digest: &Digest) -> Result<(), String> {
        self.put(Collection::Digests, &digest.date.to_string(), digest)
    }

    pub fn habits(&self) -> Result<Vec<Habit>, String> {
        self.list(Collection::Habits)
    }

    pub fn next_habit_id(&mut self) -> Result<i64, String> {
        self.next_id(Collection::Habits)
    }

    pub fn save_habit(&mut self, habit: &Habit) -> Result<(), String> {
        self.put(Collection::Habits, &id_key(habit.id), habit)
    }

    pub fn habit_logs(&self) -> Result<Vec<HabitLog>, String> {
        self.list(Collection::HabitLogs)
    }

    /// One log per habit and day; a later status replaces the earlier one.
    pub fn save_habit_log(&mut self, log: &HabitLog) -> Result<(), String> {
        let key = format!("{}:{}", id_key(log.habit_id), log.date);
        self.put(Collection::HabitLogs, &key, log)
    }

    pub fn habit_nudges(&self) -> Result<Vec<HabitNudge>, String> {
        self.list(Collection::HabitNudges)
    }

    pub fn add_habit_nudge(&mut self, nudge: &HabitNudge) -> Result<(), String> {
        let id = self.next_id(Collection::HabitNudges)?;
        self.put(Collection::HabitNudges, &id_key(id), nudge)
    }

    pub fn coaching_profile(&self) -> Result<CoachingProfile, String> {
        Ok(self
            .get(Collection::CoachingProfile, SINGLETON)?
            .unwrap_or_default())
    }

    pub fn save_coaching_profile(&mut self, profile: &CoachingProfile) -> Result<(), String> {
        self.put(Collection::CoachingProfile, SINGLETON, profile)
    }

    pub fn fact(&self, key: &str) -> Result<Option<MemoryFact>, String> {
        self.get(Collection::Facts, &format!("user:{key}"))
    }

    pub fn facts(&self) -> Result<Vec<MemoryFact>, String> {
        self.list(Collection::Facts)
    }

    pub fn upsert_fact(
        &mut self,
        key: &str,
        value: &str,
        confidence: i64,
        now: DateTime<Utc>,
    ) -> Result<MemoryFact, String> {
        let fact = MemoryFact {
            subject: "user".to_string(),
            key: key.to_string(),
            value: value.to_string(),
            confidence,
            updated_at: now,
        };
        self.put(Collection::Facts, &format!("user:{key}"), &fact)?;
        Ok(fact)
    }

    pub fn add_message(
        &mut self,
        direction: Direction,
        chat_id: &str,
        sender_id: Option<&str>,
        body: &str,
        raw: Value,
        now: DateTime<Utc>,
    ) -> Result<StoredMessage, String> {
        let message = StoredMessage {
            id: self.next_id(Collection::Messages)?,
            direction,
            chat_id: chat_id.to_string(),
            sender_id: sender_id.map(|v| v.to_string()),
            body: body.to_string(),
            raw,
            created_at: now,
        };
        self.put(Collection::Messages, &id_key(message.id), &message)?;
        Ok(message)
    }

    pub fn messages(&self) -> Result<Vec<StoredMessage>, String> {
        self.list(Collection::Messages)
    }

    pub fn tasks(&self) -> Result<Vec<Task>, String> {
        self.list(Collection::Tasks)
    }

    pub fn save_task(&mut self, task: &Task) -> Result<(), String> {
        self.put(Collection::Tasks, &task.id, task)
    }

    /// The persisted singleton, created from `defaults` on first use.
    pub fn system_config(&mut self, defaults: &SystemConfig) -> Result<SystemConfig, String> {
        if let Some(existing) = self.get(Collection::SystemConfig, SINGLETON)? {
            return Ok(existing);
        }
        self.put(Collection::SystemConfig, SINGLETON, defaults)?;
        Ok(defaults.clone())
    }

    pub fn add_tool_run(&mut self, run: &ToolRun) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store.tool_runs.push(run.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.add_tool_run(run),
        }
    }

    pub fn tool_runs(&self) -> Result<Vec<ToolRun>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.tool_runs.clone()),
            StoreBackend::Sqlite(store) => store.tool_runs(),
        }
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        let mut ddl = String::from(
            "
            CREATE TABLE IF NOT EXISTS id_counters (
                collection TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tool_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tool_name TEXT NOT NULL,
                status TEXT NOT NULL,
                decision_source TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                created_at TEXT NOT NULL,
                record_json TEXT NOT NULL
            );
            ",
        );
        for c in Collection::ALL {
            ddl.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {} (doc_key TEXT PRIMARY KEY, body TEXT NOT NULL);\n",
                c.table()
            ));
        }
        conn.execute_batch(&ddl).map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn put(&mut self, c: Collection, key: &str, body: &str) -> Result<(), String> {
        self.conn
            .execute(
                &format!(
                    "
                    INSERT INTO {}(doc_key, body) VALUES (?1, ?2)
                    ON CONFLICT(doc_key) DO UPDATE SET body=excluded.body
                    ",
                    c.table()
                ),
                params![key, body],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn insert_new(&mut self, c: Collection, key: &str, body: &str) -> Result<bool, String> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO {}(doc_key, body) VALUES (?1, ?2)",
                    c.table()
                ),
                params![key, body],
            )
            .map_err(|e| e.to_string())?;
        Ok(changed == 1)
    }

    fn get(&self, c: Collection, key: &str) -> Result<Option<String>, String> {
        self.conn
            .query_row(
                &format!("SELECT body FROM {} WHERE doc_key = ?1", c.table()),
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn list(&self, c: Collection) -> Result<Vec<String>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT body FROM {} ORDER BY doc_key", c.table()))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
    }

    fn next_id(&mut self, c: Collection) -> Result<i64, String> {
        self.conn
            .query_row(
                "
                INSERT INTO id_counters(collection, value) VALUES (?1, 1)
                ON CONFLICT(collection) DO UPDATE SET value = value + 1
                RETURNING value
                ",
                params![c.table()],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())
    }

    fn add_tool_run(&mut self, run: &ToolRun) -> Result<(), String> {
        let json = serde_json::to_string(run).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "
                INSERT INTO tool_runs
                (tool_name, status, decision_source, requested_by, risk_level, created_at, record_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    run.tool_name,
                    enum_label(&run.status),
                    enum_label(&run.decision_source),
                    enum_label(&run.requested_by),
                    run.risk_level.as_str(),
                    run.created_at.to_rfc3339(),
                    json
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn tool_runs(&self) -> Result<Vec<ToolRun>, String> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_json FROM tool_runs ORDER BY id")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| e.to_string())?;
        rows.map(|row| {
            let json = row.map_err(|e| e.to_string())?;
            serde_json::from_str(&json).map_err(|e| e.to_string())
        })
        .collect()
    }
}
