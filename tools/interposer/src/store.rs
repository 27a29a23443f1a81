//! The on-disk outcome store ("tape").
//!
//! One SQLite file per recording. It holds a format marker, the ordered
//! outcomes recorded for each parameter hash, and the per-channel call order
//! written when a recording session closes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{CallError, InterposerError};
use crate::logging::{append_run_log, Level};

type StoreResult<T> = Result<T, InterposerError>;

const KEY_FORMAT: &str = "format_version";
/// Marker key used by stores written before `format_version` existed.
const KEY_LEGACY_FORMAT: &str = "version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Playback,
    Recording,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playback => "playback",
            Self::Recording => "recording",
        }
    }
}

/// Version marker of a store; decides how its records are interpreted.
///
/// - 1: bare results, no exceptions
/// - 2: result/exception pairs
/// - 3: the call identity names its channel `channel` (was `context`)
/// - 4: per-channel call order is verified on playback
/// - 5: timestamps and enumerated constants canonicalize
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormatVersion(u32);

impl FormatVersion {
    pub const LEGACY: Self = Self(1);
    pub const CURRENT: Self = Self(5);

    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn records_exceptions(self) -> bool {
        self.0 >= 2
    }

    pub fn channel_label(self) -> &'static str {
        if self.0 >= 3 {
            "channel"
        } else {
            "context"
        }
    }

    pub fn tracks_call_order(self) -> bool {
        self.0 >= 4
    }

    pub fn encodes_extended_params(self) -> bool {
        self.0 >= 5
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What one occurrence of a call produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(Value),
    Exception(CallError),
}

impl Outcome {
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception(_))
    }
}

/// Stored shape of an outcome from format 2 on.
#[derive(Debug, Serialize, Deserialize)]
struct OutcomePair {
    result: Value,
    exception: Option<CallError>,
}

pub fn encode_outcome(format: FormatVersion, outcome: &Outcome) -> StoreResult<String> {
    let encoded = if format.records_exceptions() {
        let pair = match outcome {
            Outcome::Result(result) => OutcomePair {
                result: result.clone(),
                exception: None,
            },
            Outcome::Exception(error) => OutcomePair {
                result: Value::Null,
                exception: Some(error.clone()),
            },
        };
        serde_json::to_string(&pair)
    } else {
        match outcome {
            Outcome::Result(result) => serde_json::to_string(result),
            Outcome::Exception(error) => {
                return Err(InterposerError::Playback(format!(
                    "format {format} recordings cannot hold exceptions ({error})"
                )))
            }
        }
    };
    encoded.map_err(|e| InterposerError::Database(e.to_string()))
}

pub fn decode_outcome(format: FormatVersion, payload: &str) -> StoreResult<Outcome> {
    let corrupt = |e: serde_json::Error| InterposerError::Database(format!("corrupt outcome: {e}"));
    if !format.records_exceptions() {
        return serde_json::from_str(payload).map(Outcome::Result).map_err(corrupt);
    }
    let pair: OutcomePair = serde_json::from_str(payload).map_err(corrupt)?;
    Ok(match pair.exception {
        Some(error) => Outcome::Exception(error),
        None => Outcome::Result(pair.result),
    })
}

pub type ChannelOrder = BTreeMap<String, Vec<Value>>;

/// Everything a store holds, for offline inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TapeDump {
    pub format_version: FormatVersion,
    pub outcomes: BTreeMap<String, Vec<Outcome>>,
    pub channel_order: ChannelOrder,
}

impl TapeDump {
    pub fn outcome_count(&self) -> usize {
        self.outcomes.values().map(Vec::len).sum()
    }
}

pub struct Store {
    conn: Option<Connection>,
    path: PathBuf,
    mode: Mode,
    format: FormatVersion,
}

impl Store {
    /// Playback opens read-only and requires an existing recording;
    /// Recording creates the file when absent.
    pub fn open(path: impl AsRef<Path>, mode: Mode) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (conn, format) = match mode {
            Mode::Playback => open_for_playback(&path)?,
            Mode::Recording => open_for_recording(&path)?,
        };
        append_run_log(
            Level::Debug,
            "tape_store.opened",
            json!({
                "path": path.display().to_string(),
                "mode": mode.as_str(),
                "format_version": format.get(),
            }),
        );
        Ok(Self {
            conn: Some(conn),
            path,
            mode,
            format,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn format_version(&self) -> FormatVersion {
        self.format
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn conn(&self) -> StoreResult<&Connection> {
        self.conn.as_ref().ok_or(InterposerError::Closed)
    }

    /// All outcomes recorded for `hash`, in recording order.
    pub fn get(&self, hash: &str) -> StoreResult<Option<Vec<Outcome>>> {
        let conn = self.conn()?;
        let mut statement = conn
            .prepare("SELECT payload FROM outcomes WHERE hash = ?1 ORDER BY idx ASC")
            .map_err(db_err)?;
        let payloads = statement
            .query_map([hash], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        if payloads.is_empty() {
            return Ok(None);
        }
        payloads
            .iter()
            .map(|payload| decode_outcome(self.format, payload))
            .collect::<StoreResult<Vec<_>>>()
            .map(Some)
    }

    /// Append `outcome` after the ones already stored for `hash`; returns its index.
    pub fn append(&self, hash: &str, outcome: &Outcome) -> StoreResult<usize> {
        if self.mode != Mode::Recording {
            return Err(InterposerError::Playback(
                "cannot append to a recording opened for playback".to_string(),
            ));
        }
        let payload = encode_outcome(self.format, outcome)?;
        let conn = self.conn()?;
        let next: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(idx) + 1, 0) FROM outcomes WHERE hash = ?1",
                [hash],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        conn.execute(
            "INSERT INTO outcomes(hash, idx, payload) VALUES (?1, ?2, ?3)",
            params![hash, next, payload],
        )
        .map_err(db_err)?;
        Ok(next as usize)
    }

    /// The per-channel call order written by the last recording session.
    pub fn channel_order(&self) -> StoreResult<ChannelOrder> {
        let conn = self.conn()?;
        let mut order = ChannelOrder::new();
        if !table_exists(conn, "channel_order")? {
            return Ok(order);
        }
        let mut statement = conn
            .prepare("SELECT channel, call FROM channel_order ORDER BY channel ASC, idx ASC")
            .map_err(db_err)?;
        let rows = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        for (channel, call) in rows {
            let call: Value = serde_json::from_str(&call)
                .map_err(|e| InterposerError::Database(format!("corrupt call order: {e}")))?;
            order.entry(channel).or_default().push(call);
        }
        Ok(order)
    }

    /// Replace the stored call order with `order` in one transaction.
    pub fn write_channel_order(&mut self, order: &ChannelOrder) -> StoreResult<()> {
        if self.mode != Mode::Recording {
            return Err(InterposerError::Playback(
                "cannot write call order to a recording opened for playback".to_string(),
            ));
        }
        let conn = self.conn.as_mut().ok_or(InterposerError::Closed)?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM channel_order", []).map_err(db_err)?;
        for (channel, calls) in order {
            for (idx, call) in calls.iter().enumerate() {
                let call = serde_json::to_string(call)
                    .map_err(|e| InterposerError::Database(e.to_string()))?;
                tx.execute(
                    "INSERT INTO channel_order(channel, idx, call) VALUES (?1, ?2, ?3)",
                    params![channel, idx as i64, call],
                )
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    pub fn dump(&self) -> StoreResult<TapeDump> {
        let conn = self.conn()?;
        let mut statement = conn
            .prepare("SELECT hash, payload FROM outcomes ORDER BY hash ASC, idx ASC")
            .map_err(db_err)?;
        let rows = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        let mut outcomes: BTreeMap<String, Vec<Outcome>> = BTreeMap::new();
        for (hash, payload) in rows {
            let outcome = decode_outcome(self.format, &payload)?;
            outcomes.entry(hash).or_default().push(outcome);
        }
        Ok(TapeDump {
            format_version: self.format,
            outcomes,
            channel_order: self.channel_order()?,
        })
    }

    /// Release the file. Closing a closed store does nothing.
    pub fn close(&mut self) -> StoreResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| db_err(e))?;
        append_run_log(
            Level::Debug,
            "tape_store.closed",
            json!({ "path": self.path.display().to_string(), "mode": self.mode.as_str() }),
        );
        Ok(())
    }
}

fn open_for_playback(path: &Path) -> StoreResult<(Connection, FormatVersion)> {
    if !path.is_file() {
        return Err(InterposerError::StoreNotFound(path.to_path_buf()));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(db_err)?;
    if !table_exists(&conn, "outcomes")? {
        return Err(InterposerError::Playback(format!(
            "{} holds no recorded outcomes",
            path.display()
        )));
    }
    let format = read_format(&conn)?.unwrap_or(FormatVersion::LEGACY);
    if format > FormatVersion::CURRENT {
        return Err(InterposerError::IncompatibleFormat {
            found: format.get(),
            expected: FormatVersion::CURRENT.get(),
        });
    }
    Ok((conn, format))
}

fn open_for_recording(path: &Path) -> StoreResult<(Connection, FormatVersion)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| InterposerError::Io(e.to_string()))?;
    }

    // A zero-byte file is what an interrupted copy or compression step leaves.
    if path.exists() {
        let meta = std::fs::metadata(path).map_err(|e| InterposerError::Io(e.to_string()))?;
        if meta.len() == 0 {
            return Err(InterposerError::Database(format!(
                "recording is 0 bytes (corrupt): {}",
                path.display()
            )));
        }
    }

    let mut conn = Connection::open(path).map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    // Outcomes without a marker were written before versioning existed.
    let existing = match read_format(&conn)? {
        Some(format) => Some(format),
        None => table_exists(&conn, "outcomes")?.then_some(FormatVersion::LEGACY),
    };
    if let Some(format) = existing.filter(|format| *format != FormatVersion::CURRENT) {
        return Err(InterposerError::IncompatibleFormat {
            found: format.get(),
            expected: FormatVersion::CURRENT.get(),
        });
    }

    run_migrations(&mut conn)?;
    if read_format(&conn)?.is_none() {
        conn.execute(
            "INSERT INTO tape_meta(key, value) VALUES (?1, ?2)",
            params![KEY_FORMAT, FormatVersion::CURRENT.get().to_string()],
        )
        .map_err(db_err)?;
    }
    Ok((conn, FormatVersion::CURRENT))
}

fn read_format(conn: &Connection) -> StoreResult<Option<FormatVersion>> {
    if !table_exists(conn, "tape_meta")? {
        return Ok(None);
    }
    for key in [KEY_FORMAT, KEY_LEGACY_FORMAT] {
        let value: Option<String> = conn
            .query_row("SELECT value FROM tape_meta WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        if let Some(value) = value {
            let version = value.trim().parse::<u32>().map_err(|_| {
                InterposerError::Database(format!("invalid format marker `{value}`"))
            })?;
            return Ok(Some(FormatVersion::new(version)));
        }
    }
    Ok(None)
}

fn table_exists(conn: &Connection, name: &str) -> StoreResult<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(db_err)
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../migrations/0001_tape.sql"))];

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL);",
    )
    .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, chrono::Utc::now().timestamp()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        append_run_log(
            Level::Info,
            "tape_store.migration.applied",
            json!({ "version": version }),
        );
    }
    Ok(())
}

fn db_err(error: rusqlite::Error) -> InterposerError {
    InterposerError::Database(error.to_string())
}
