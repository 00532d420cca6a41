//! Detection store — SQLite persistence
//!
//! One row per Frigate event. The reconciler reads and writes through the
//! [`DetectionStore`] contract; [`DetectionRepository`] is the rusqlite
//! implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// The durable best-classification record for one Frigate event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Store key, `None` until the record has been created.
    pub id: Option<i64>,
    pub detection_time: DateTime<Utc>,
    pub detection_index: u32,
    pub score: f32,
    pub display_name: String,
    pub category_name: String,
    #[serde(rename = "frigate_event")]
    pub event_id: String,
    pub camera_name: String,
}

/// Detection count for one species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesCount {
    pub species: String,
    pub count: u64,
}

/// Keyed-by-event storage consumed by the reconciler.
pub trait DetectionStore: Send + Sync {
    fn find_by_event_id(&self, event_id: &str) -> Result<Option<Detection>>;

    /// Insert a new record; returns it with the store key assigned.
    fn create(&self, detection: &Detection) -> Result<Detection>;

    /// Overwrite the mutable fields of the record with the same event id.
    fn update(&self, detection: &Detection) -> Result<()>;
}

const COLUMNS: &str = "id, detection_time, detection_index, score, display_name, \
                       category_name, frigate_event, camera_name";

pub struct DetectionRepository {
    conn: Mutex<Connection>,
}

impl DetectionRepository {
    pub fn open(path: &str) -> Result<Self> {
        let resolved = resolve_db_path(path);
        let conn = Connection::open(&resolved)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.migrate()?;
        Ok(repo)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StoreUnavailable("detection store lock poisoned".into()))
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS detections (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                detection_time   TEXT    NOT NULL,
                detection_index  INTEGER NOT NULL,
                score            REAL    NOT NULL,
                display_name     TEXT    NOT NULL,
                category_name    TEXT    NOT NULL,
                frigate_event    TEXT    NOT NULL UNIQUE,
                camera_name      TEXT    NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detection_time ON detections (detection_time);
            CREATE INDEX IF NOT EXISTS idx_display_name   ON detections (display_name);
        ",
        )?;
        Ok(())
    }

    /// Most recent detections first.
    pub fn recent(&self, limit: u32, offset: u32) -> Result<Vec<Detection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM detections
             ORDER BY detection_time DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt.query_map(params![limit, offset], map_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Number of detections per display name, most frequent first.
    pub fn species_counts(&self) -> Result<Vec<SpeciesCount>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT display_name, COUNT(*) AS cnt FROM detections
             GROUP BY display_name ORDER BY cnt DESC, display_name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SpeciesCount {
                species: row.get(0)?,
                count: row.get(1)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl DetectionStore for DetectionRepository {
    fn find_by_event_id(&self, event_id: &str) -> Result<Option<Detection>> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM detections WHERE frigate_event = ?1"),
                params![event_id],
                map_row,
            )
            .optional()?;
        Ok(found)
    }

    fn create(&self, detection: &Detection) -> Result<Detection> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO detections
             (detection_time, detection_index, score, display_name,
              category_name, frigate_event, camera_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                detection.detection_time.to_rfc3339(),
                detection.detection_index,
                detection.score,
                detection.display_name,
                detection.category_name,
                detection.event_id,
                detection.camera_name,
            ],
        )?;
        Ok(Detection {
            id: Some(conn.last_insert_rowid()),
            ..detection.clone()
        })
    }

    fn update(&self, detection: &Detection) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE detections
             SET detection_time = ?1, detection_index = ?2, score = ?3,
                 display_name = ?4, category_name = ?5
             WHERE frigate_event = ?6",
            params![
                detection.detection_time.to_rfc3339(),
                detection.detection_index,
                detection.score,
                detection.display_name,
                detection.category_name,
                detection.event_id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::DetectionMissing(detection.event_id.clone()));
        }
        Ok(())
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Detection> {
    let ts: String = row.get(1)?;
    Ok(Detection {
        id: row.get(0)?,
        detection_time: parse_timestamp(&ts),
        detection_index: row.get(2)?,
        score: row.get(3)?,
        display_name: row.get(4)?,
        category_name: row.get(5)?,
        event_id: row.get(6)?,
        camera_name: row.get(7)?,
    })
}

/// Parse RFC 3339, falling back to SQLite's `YYYY-MM-DD HH:MM:SS[.f]` form.
fn parse_timestamp(value: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return dt.with_timezone(&Utc);
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
        .unwrap_or_else(Utc::now)
}

/// Resolve bare DB filenames to the local app data directory.
fn resolve_db_path(db_path: &str) -> String {
    let path = Path::new(db_path);
    if path.is_absolute() || path.parent().is_some_and(|p| !p.as_os_str().is_empty()) {
        return db_path.to_string();
    }
    if let Some(data_dir) = dirs::data_local_dir() {
        let full = data_dir.join("yardbird").join(db_path);
        if let Some(parent) = full.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return full.to_string_lossy().to_string();
    }
    db_path.to_string()
}
