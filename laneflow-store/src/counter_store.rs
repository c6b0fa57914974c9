//! Counter snapshots and normalized count history.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use laneflow_types::timestamp::parse_legacy_local;
use laneflow_types::{Category, CountersSnapshot, Direction};

use crate::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const MIGRATION_BATCH: usize = 10_000;

/// Rows read back from the count history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEvent {
    pub id: i64,
    pub rtsp_url: String,
    /// Unix epoch seconds.
    pub timestamp: i64,
    pub category: Category,
    pub direction: Direction,
}

/// Filters for [`CounterStore::history_events`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub rtsp_url: Option<String>,
    /// Inclusive epoch bounds.
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraRow {
    pub id: i64,
    pub rtsp_url: String,
    pub description: Option<String>,
    pub created_at: i64,
}

/// Rolling 24-hour figures for the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Metrics24h {
    pub total: u64,
    pub per_hour_avg: f64,
    pub peak_hour_count: u64,
}

/// The counters database.
///
/// All writes are serialized by the internal mutex; readers in other
/// processes go through the write-ahead log. Opening migrates the legacy
/// string-typed history once, if present.
pub struct CounterStore {
    conn: Mutex<Connection>,
}

impl CounterStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", 10_000)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cameras (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 rtsp_url TEXT UNIQUE NOT NULL,
                 description TEXT,
                 created_at INTEGER DEFAULT (strftime('%s', 'now'))
             );
             CREATE TABLE IF NOT EXISTS counters (
                 id INTEGER PRIMARY KEY,
                 rtsp_url TEXT NOT NULL,
                 category_name TEXT NOT NULL,
                 direction_name TEXT NOT NULL,
                 value INTEGER NOT NULL DEFAULT 0,
                 updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
             );
             CREATE TABLE IF NOT EXISTS history_v2 (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 camera_id INTEGER NOT NULL,
                 timestamp INTEGER NOT NULL,
                 category_id INTEGER NOT NULL,
                 direction_id INTEGER NOT NULL,
                 FOREIGN KEY(camera_id) REFERENCES cameras(id)
             );
             CREATE INDEX IF NOT EXISTS idx_hist_v2_time ON history_v2(timestamp DESC);
             CREATE INDEX IF NOT EXISTS idx_hist_v2_cam ON history_v2(camera_id);",
        )?;

        migrate_legacy_history(&mut conn)?;

        info!("counter store ready: {}", path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Rewrite the denormalized snapshot rows for one camera in a single
    /// transaction: delete then insert per (category, direction).
    pub fn save_snapshot(&self, rtsp_url: &str, snapshot: &CountersSnapshot) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM counters WHERE rtsp_url = ?1", params![rtsp_url])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO counters (rtsp_url, category_name, direction_name, value)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (category, direction, value) in snapshot.iter() {
                stmt.execute(params![
                    rtsp_url,
                    category.label(),
                    direction.wire_name(),
                    value as i64
                ])?;
            }
        }
        tx.commit()?;
        debug!(
            "snapshot saved for {}: {} vehicles",
            rtsp_url,
            snapshot.grand_total()
        );
        Ok(())
    }

    /// Load the snapshot for one camera; unknown rows are ignored, missing
    /// rows read as zero.
    pub fn load_snapshot(&self, rtsp_url: &str) -> Result<CountersSnapshot> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT category_name, direction_name, value FROM counters WHERE rtsp_url = ?1",
        )?;
        let rows = stmt.query_map(params![rtsp_url], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut snapshot = CountersSnapshot::default();
        for row in rows {
            let (category_name, direction_name, value) = row?;
            let category = Category::from_label(&category_name);
            let direction = Direction::from_wire_name(&direction_name);
            if category == Category::Undefined || direction == Direction::Undefined {
                warn!("ignoring unknown counter row {category_name}/{direction_name}");
                continue;
            }
            snapshot.set(category, direction, value.max(0) as u64);
        }
        Ok(snapshot)
    }

    /// Append one count event stamped now.
    pub fn append_event(
        &self,
        rtsp_url: &str,
        category: Category,
        direction: Direction,
    ) -> Result<()> {
        self.append_event_at(rtsp_url, category, direction, chrono::Utc::now().timestamp())
    }

    /// Append one count event with an explicit epoch timestamp.
    pub fn append_event_at(
        &self,
        rtsp_url: &str,
        category: Category,
        direction: Direction,
        epoch: i64,
    ) -> Result<()> {
        if rtsp_url.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let camera_id = resolve_camera_id(&conn, rtsp_url)?;
        conn.execute(
            "INSERT INTO history_v2 (camera_id, timestamp, category_id, direction_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![camera_id, epoch, category.as_id(), direction.as_id()],
        )?;
        Ok(())
    }

    /// Passive WAL checkpoint so readers see a compact file.
    pub fn flush(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let _busy: i64 = conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |row| row.get(0))?;
        Ok(())
    }

    /// Wipe counters and history. Cameras are kept.
    pub fn clear_all(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM counters", [])?;
        conn.execute("DELETE FROM history_v2", [])?;
        info!("counter store cleared");
        Ok(())
    }

    pub fn cameras(&self) -> Result<Vec<CameraRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, rtsp_url, description, created_at FROM cameras ORDER BY rtsp_url",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CameraRow {
                id: row.get(0)?,
                rtsp_url: row.get(1)?,
                description: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Recent history, newest first.
    pub fn history_events(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEvent>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut sql = String::from(
            "SELECT h.id, c.rtsp_url, h.timestamp, h.category_id, h.direction_id
             FROM history_v2 h JOIN cameras c ON h.camera_id = c.id WHERE 1=1",
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(url) = &filter.rtsp_url {
            sql.push_str(" AND c.rtsp_url = ?");
            values.push(Box::new(url.clone()));
        }
        if let Some(start) = filter.start {
            sql.push_str(" AND h.timestamp >= ?");
            values.push(Box::new(start));
        }
        if let Some(end) = filter.end {
            sql.push_str(" AND h.timestamp <= ?");
            values.push(Box::new(end));
        }
        sql.push_str(" ORDER BY h.timestamp DESC LIMIT ?");
        values.push(Box::new(filter.limit.unwrap_or(1000) as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter().map(|v| v.as_ref())), |row| {
            Ok(HistoryEvent {
                id: row.get(0)?,
                rtsp_url: row.get(1)?,
                timestamp: row.get(2)?,
                category: Category::from_id(row.get(3)?),
                direction: Direction::from_id(row.get(4)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Count per local hour-of-day within `[day_start, day_start + 24h)`.
    pub fn hourly_traffic(
        &self,
        rtsp_url: Option<&str>,
        day_start: i64,
    ) -> Result<Vec<(u32, u64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut sql = String::from(
            "SELECT strftime('%H', datetime(h.timestamp, 'unixepoch', 'localtime')) AS hour,
                    COUNT(*)
             FROM history_v2 h JOIN cameras c ON h.camera_id = c.id
             WHERE h.timestamp >= ?1 AND h.timestamp < ?2",
        );
        let day_end = day_start + 86_400;
        let mut values: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(day_start), Box::new(day_end)];
        if let Some(url) = rtsp_url {
            sql.push_str(" AND c.rtsp_url = ?3");
            values.push(Box::new(url.to_string()));
        }
        sql.push_str(" GROUP BY hour ORDER BY hour");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter().map(|v| v.as_ref())), |row| {
            let hour: String = row.get(0)?;
            let total: i64 = row.get(1)?;
            Ok((hour.parse::<u32>().unwrap_or(0), total as u64))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Event counts per category, optionally bounded by camera and epoch
    /// range.
    pub fn vehicle_distribution(&self, filter: &HistoryFilter) -> Result<Vec<(Category, u64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut sql = String::from(
            "SELECT h.category_id, COUNT(*)
             FROM history_v2 h JOIN cameras c ON h.camera_id = c.id WHERE 1=1",
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(url) = &filter.rtsp_url {
            sql.push_str(" AND c.rtsp_url = ?");
            values.push(Box::new(url.clone()));
        }
        if let Some(start) = filter.start {
            sql.push_str(" AND h.timestamp >= ?");
            values.push(Box::new(start));
        }
        if let Some(end) = filter.end {
            sql.push_str(" AND h.timestamp <= ?");
            values.push(Box::new(end));
        }
        sql.push_str(" GROUP BY h.category_id ORDER BY COUNT(*) DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter().map(|v| v.as_ref())), |row| {
            let category: i64 = row.get(0)?;
            let total: i64 = row.get(1)?;
            Ok((Category::from_id(category), total as u64))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Totals per local weekday (0 = Sunday) and category over the last
    /// `days` days.
    pub fn daily_comparison(
        &self,
        rtsp_url: Option<&str>,
        days: u32,
    ) -> Result<Vec<(u32, Category, u64)>> {
        let since = chrono::Utc::now().timestamp() - days as i64 * 86_400;
        self.grouped_comparison(
            rtsp_url,
            since,
            "CAST(strftime('%w', datetime(h.timestamp, 'unixepoch', 'localtime')) AS INTEGER)",
        )
        .map(|rows| {
            rows.into_iter()
                .map(|(key, cat, n)| (key.parse::<u32>().unwrap_or(0), cat, n))
                .collect()
        })
    }

    /// Totals per ISO-ish week label and category over the last `weeks`
    /// weeks.
    pub fn weekly_comparison(
        &self,
        rtsp_url: Option<&str>,
        weeks: u32,
    ) -> Result<Vec<(String, Category, u64)>> {
        let since = chrono::Utc::now().timestamp() - weeks as i64 * 7 * 86_400;
        self.grouped_comparison(
            rtsp_url,
            since,
            "strftime('%Y-W%W', datetime(h.timestamp, 'unixepoch', 'localtime'))",
        )
    }

    fn grouped_comparison(
        &self,
        rtsp_url: Option<&str>,
        since: i64,
        group_expr: &str,
    ) -> Result<Vec<(String, Category, u64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut sql = format!(
            "SELECT {group_expr} AS grp, h.category_id, COUNT(*)
             FROM history_v2 h JOIN cameras c ON h.camera_id = c.id
             WHERE h.timestamp >= ?1",
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(since)];
        if let Some(url) = rtsp_url {
            sql.push_str(" AND c.rtsp_url = ?2");
            values.push(Box::new(url.to_string()));
        }
        sql.push_str(" GROUP BY grp, h.category_id ORDER BY grp");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter().map(|v| v.as_ref())), |row| {
            let grp: String = row.get(0)?;
            let category: i64 = row.get(1)?;
            let total: i64 = row.get(2)?;
            Ok((grp, Category::from_id(category), total as u64))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Total, hourly average and busiest-hour count over the last 24 hours.
    pub fn metrics_24h(&self, rtsp_url: Option<&str>) -> Result<Metrics24h> {
        let since = chrono::Utc::now().timestamp() - 86_400;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut sql = String::from(
            "SELECT COUNT(*) AS n,
                    strftime('%Y-%m-%d %H', datetime(h.timestamp, 'unixepoch', 'localtime')) AS grp
             FROM history_v2 h JOIN cameras c ON h.camera_id = c.id
             WHERE h.timestamp >= ?1",
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(since)];
        if let Some(url) = rtsp_url {
            sql.push_str(" AND c.rtsp_url = ?2");
            values.push(Box::new(url.to_string()));
        }
        sql.push_str(" GROUP BY grp");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter().map(|v| v.as_ref())), |row| {
            row.get::<_, i64>(0)
        })?;
        let counts: Vec<i64> = rows.collect::<rusqlite::Result<_>>()?;
        if counts.is_empty() {
            return Ok(Metrics24h::default());
        }
        let total: i64 = counts.iter().sum();
        let peak = counts.iter().copied().max().unwrap_or(0);
        Ok(Metrics24h {
            total: total as u64,
            per_hour_avg: total as f64 / 24.0,
            peak_hour_count: peak as u64,
        })
    }
}

fn resolve_camera_id(conn: &Connection, rtsp_url: &str) -> rusqlite::Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM cameras WHERE rtsp_url = ?1",
            params![rtsp_url],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute("INSERT INTO cameras (rtsp_url) VALUES (?1)", params![rtsp_url])?;
    Ok(conn.last_insert_rowid())
}

/// Legacy category names as stored by the previous system.
fn legacy_category_id(name: &str) -> i64 {
    match name {
        "Carros" => 1,
        "Motos" => 2,
        "Caminhões" => 3,
        "Ônibus" => 4,
        _ => 0,
    }
}

fn legacy_direction_id(name: &str) -> i64 {
    Direction::from_wire_name(name).as_id()
}

/// One-shot migration of the string-typed `history` table into
/// `history_v2`. Runs only while the new table is empty, so it cannot
/// double-import.
fn migrate_legacy_history(conn: &mut Connection) -> Result<()> {
    let legacy_exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='history'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if legacy_exists.is_none() {
        return Ok(());
    }
    let new_rows: i64 = conn.query_row("SELECT COUNT(*) FROM history_v2", [], |row| row.get(0))?;
    if new_rows > 0 {
        return Ok(());
    }

    info!("migrating legacy history to the normalized schema");
    conn.execute(
        "INSERT OR IGNORE INTO cameras (rtsp_url)
         SELECT DISTINCT rtsp_url FROM history
         WHERE rtsp_url IS NOT NULL AND rtsp_url != ''",
        [],
    )?;

    let mut offset = 0usize;
    loop {
        let batch: Vec<(String, String, String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT rtsp_url, timestamp, category, direction FROM history
                 ORDER BY id LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![MIGRATION_BATCH as i64, offset as i64], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        if batch.is_empty() {
            break;
        }

        let tx = conn.transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO history_v2 (camera_id, timestamp, category_id, direction_id)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (rtsp_url, ts_text, category, direction) in &batch {
                if rtsp_url.is_empty() {
                    continue;
                }
                let camera_id = resolve_camera_id(&tx, rtsp_url)?;
                let epoch = parse_legacy_local(ts_text)
                    .unwrap_or_else(|| chrono::Utc::now().timestamp());
                insert.execute(params![
                    camera_id,
                    epoch,
                    legacy_category_id(category),
                    legacy_direction_id(direction)
                ])?;
            }
        }
        tx.commit()?;
        offset += batch.len();
        debug!("migrated {offset} legacy rows");
    }

    info!("legacy migration done ({offset} rows), compacting");
    conn.execute_batch("VACUUM")?;
    Ok(())
}
