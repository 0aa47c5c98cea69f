use crate::cache::CacheStore;
use crate::error::AppError;
use crate::models::{CacheEntry, CacheKey, PowerSpec, RangeKey, SeriesOrigin, UsageSeries};
use crate::workspace::Workspace;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use tracing::warn;

pub struct Storage {
    conn: Connection,
}

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| AppError::PersistenceFailure(format!("bad timestamp '{raw}': {e}")))
}

struct CacheRow {
    id: i64,
    source: String,
    range_key: String,
    spec_hash: String,
    spec_json: String,
    origin: String,
    labels_json: String,
    kwh_json: String,
    total_kwh: f64,
    start_unix: i64,
    end_unix: i64,
    step_seconds: i64,
    created_at: String,
    updated_at: String,
}

impl CacheRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            source: r.get(1)?,
            range_key: r.get(2)?,
            spec_hash: r.get(3)?,
            spec_json: r.get(4)?,
            origin: r.get(5)?,
            labels_json: r.get(6)?,
            kwh_json: r.get(7)?,
            total_kwh: r.get(8)?,
            start_unix: r.get(9)?,
            end_unix: r.get(10)?,
            step_seconds: r.get(11)?,
            created_at: r.get(12)?,
            updated_at: r.get(13)?,
        })
    }

    fn into_entry(self) -> Result<CacheEntry, AppError> {
        let range_key: RangeKey = self.range_key.parse()?;
        let spec: PowerSpec = serde_json::from_str(&self.spec_json)?;
        let origin = SeriesOrigin::parse(&self.origin).ok_or_else(|| {
            AppError::PersistenceFailure(format!("unknown origin '{}'", self.origin))
        })?;
        let labels: Vec<String> = serde_json::from_str(&self.labels_json)?;
        let kwh: Vec<f64> = serde_json::from_str(&self.kwh_json)?;
        let series = UsageSeries::new(labels, kwh)?;
        let step_seconds = u32::try_from(self.step_seconds)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| {
                AppError::PersistenceFailure(format!("bad step_seconds {}", self.step_seconds))
            })?;

        Ok(CacheEntry {
            id: Some(self.id),
            source: self.source,
            range_key,
            spec_hash: self.spec_hash,
            spec,
            origin,
            series,
            total_kwh: self.total_kwh,
            window_start_unix: self.start_unix,
            window_end_unix: self.end_unix,
            step_seconds,
            created_at: ts_from_sql(&self.created_at)?,
            updated_at: ts_from_sql(&self.updated_at)?,
        })
    }
}

const WORKSPACE_COLUMNS: &str = "id, source, hostname, title, started_at, runtime_seconds, \
     total_kwh, idle_kwh, total_kg, idle_kg, avg_ci_g_per_kwh, last_ci_g_per_kwh, \
     last_sampled_at, created_at, updated_at";

struct WorkspaceRow {
    id: i64,
    source: String,
    hostname: String,
    title: String,
    started_at: Option<String>,
    runtime_seconds: i64,
    total_kwh: f64,
    idle_kwh: f64,
    total_kg: f64,
    idle_kg: f64,
    avg_ci_g_per_kwh: Option<f64>,
    last_ci_g_per_kwh: Option<f64>,
    last_sampled_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl WorkspaceRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            source: r.get(1)?,
            hostname: r.get(2)?,
            title: r.get(3)?,
            started_at: r.get(4)?,
            runtime_seconds: r.get(5)?,
            total_kwh: r.get(6)?,
            idle_kwh: r.get(7)?,
            total_kg: r.get(8)?,
            idle_kg: r.get(9)?,
            avg_ci_g_per_kwh: r.get(10)?,
            last_ci_g_per_kwh: r.get(11)?,
            last_sampled_at: r.get(12)?,
            created_at: r.get(13)?,
            updated_at: r.get(14)?,
        })
    }

    fn into_workspace(self) -> Result<Workspace, AppError> {
        Ok(Workspace {
            id: self.id,
            source: self.source,
            hostname: self.hostname,
            title: self.title,
            started_at: self.started_at.as_deref().map(ts_from_sql).transpose()?,
            runtime_seconds: self.runtime_seconds.max(0) as u64,
            total_kwh: self.total_kwh,
            idle_kwh: self.idle_kwh,
            total_kg: self.total_kg,
            idle_kg: self.idle_kg,
            avg_ci_g_per_kwh: self.avg_ci_g_per_kwh,
            last_ci_g_per_kwh: self.last_ci_g_per_kwh,
            last_sampled_at: self.last_sampled_at.as_deref().map(ts_from_sql).transpose()?,
            created_at: ts_from_sql(&self.created_at)?,
            updated_at: ts_from_sql(&self.updated_at)?,
        })
    }
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        let this = Self { conn };
        this.init()?;
        Ok(this)
    }

    fn init(&self) -> Result<(), AppError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS energy_cache (
                id INTEGER PRIMARY KEY,
                source TEXT NOT NULL,
                range_key TEXT NOT NULL,
                spec_hash TEXT NOT NULL,
                spec_json TEXT NOT NULL,
                origin TEXT NOT NULL,
                labels_json TEXT NOT NULL,
                kwh_json TEXT NOT NULL,
                total_kwh REAL NOT NULL,
                start_unix INTEGER NOT NULL,
                end_unix INTEGER NOT NULL,
                step_seconds INTEGER NOT NULL CHECK (step_seconds > 0),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS energy_cache_key
                ON energy_cache (source, range_key, spec_hash, updated_at);

            CREATE TABLE IF NOT EXISTS workspaces (
                id INTEGER PRIMARY KEY,
                source TEXT NOT NULL,
                hostname TEXT NOT NULL,
                title TEXT NOT NULL,
                started_at TEXT,
                runtime_seconds INTEGER NOT NULL DEFAULT 0 CHECK (runtime_seconds >= 0),
                total_kwh REAL NOT NULL DEFAULT 0 CHECK (total_kwh >= 0),
                idle_kwh REAL NOT NULL DEFAULT 0 CHECK (idle_kwh >= 0),
                total_kg REAL NOT NULL DEFAULT 0 CHECK (total_kg >= 0),
                idle_kg REAL NOT NULL DEFAULT 0 CHECK (idle_kg >= 0),
                avg_ci_g_per_kwh REAL,
                last_ci_g_per_kwh REAL,
                last_sampled_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (source, hostname)
            );
            "#,
        )?;
        Ok(())
    }

    pub fn insert_cache_entry(&mut self, entry: &CacheEntry) -> Result<i64, AppError> {
        self.conn.execute(
            "INSERT INTO energy_cache (source, range_key, spec_hash, spec_json, origin, labels_json,
                kwh_json, total_kwh, start_unix, end_unix, step_seconds, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.source,
                entry.range_key.as_label(),
                entry.spec_hash,
                serde_json::to_string(&entry.spec)?,
                entry.origin.as_label(),
                serde_json::to_string(&entry.series.labels)?,
                serde_json::to_string(&entry.series.kwh)?,
                entry.total_kwh,
                entry.window_start_unix,
                entry.window_end_unix,
                entry.step_seconds,
                ts_to_sql(entry.created_at),
                ts_to_sql(entry.updated_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn latest_cache_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, AppError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source, range_key, spec_hash, spec_json, origin, labels_json, kwh_json,
                    total_kwh, start_unix, end_unix, step_seconds, created_at, updated_at
             FROM energy_cache
             WHERE source = ? AND range_key = ? AND spec_hash = ?
             ORDER BY updated_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(
            params![key.source, key.range.as_label(), key.spec_hash],
            CacheRow::from_row,
        )?;

        for row in rows {
            let row = row?;
            let id = row.id;
            match row.into_entry() {
                Ok(entry) if entry.series.is_consistent_with(entry.total_kwh) => {
                    return Ok(Some(entry))
                }
                Ok(_) => warn!(id, "skipping cache row whose total does not match its bins"),
                Err(err) => warn!(id, error = %err, "skipping undecodable cache row"),
            }
        }
        Ok(None)
    }

    #[cfg(test)]
    pub fn count_cache_entries(&self, key: &CacheKey) -> Result<u64, AppError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM energy_cache WHERE source = ? AND range_key = ? AND spec_hash = ?",
            params![key.source, key.range.as_label(), key.spec_hash],
            |r| r.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn load_or_create_workspace(
        &mut self,
        source: &str,
        hostname: &str,
        now: DateTime<Utc>,
    ) -> Result<Workspace, AppError> {
        let now_str = ts_to_sql(now);
        self.conn.execute(
            "INSERT OR IGNORE INTO workspaces (source, hostname, title, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
            params![source, hostname, hostname, now_str, now_str],
        )?;

        let row = self.conn.query_row(
            &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE source = ? AND hostname = ?"),
            params![source, hostname],
            WorkspaceRow::from_row,
        )?;
        row.into_workspace()
    }

    pub fn save_workspace(&mut self, ws: &Workspace) -> Result<(), AppError> {
        let changed = self.conn.execute(
            "UPDATE workspaces SET title = ?, started_at = ?, runtime_seconds = ?, total_kwh = ?,
                idle_kwh = ?, total_kg = ?, idle_kg = ?, avg_ci_g_per_kwh = ?,
                last_ci_g_per_kwh = ?, last_sampled_at = ?, updated_at = ?
             WHERE id = ?",
            params![
                ws.title,
                ws.started_at.map(ts_to_sql),
                ws.runtime_seconds as i64,
                ws.total_kwh,
                ws.idle_kwh,
                ws.total_kg,
                ws.idle_kg,
                ws.avg_ci_g_per_kwh,
                ws.last_ci_g_per_kwh,
                ws.last_sampled_at.map(ts_to_sql),
                ts_to_sql(ws.updated_at),
                ws.id,
            ],
        )?;
        if changed == 0 {
            return Err(AppError::PersistenceFailure(format!(
                "workspace {} does not exist",
                ws.id
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn find_workspace(&self, source: &str, hostname: &str) -> Result<Option<Workspace>, AppError> {
        use rusqlite::OptionalExtension;

        self.conn
            .query_row(
                &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE source = ? AND hostname = ?"),
                params![source, hostname],
                WorkspaceRow::from_row,
            )
            .optional()?
            .map(WorkspaceRow::into_workspace)
            .transpose()
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>, AppError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces ORDER BY updated_at DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map([], WorkspaceRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(WorkspaceRow::into_workspace).collect()
    }
}

impl CacheStore for Storage {
    fn latest_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, AppError> {
        self.latest_cache_entry(key)
    }

    fn insert_entry(&mut self, entry: &CacheEntry) -> Result<i64, AppError> {
        self.insert_cache_entry(entry)
    }
}
