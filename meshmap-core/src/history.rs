//! Node position history.
//!
//! A single-file embedded SQL table of observations with WAL journaling for
//! concurrent reads. Writes are throttled per node; the throttle check and
//! the insert happen under one lock so concurrent callers cannot slip
//! duplicate rows in. Every statement is parameterized.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{MapsError, MapsResult};
use crate::now_epoch;

pub const DEFAULT_THROTTLE_SECONDS: i64 = 60;
pub const DEFAULT_RETENTION_SECONDS: i64 = 30 * 24 * 3600;

/// Cap on trajectory query size.
const MAX_TRAJECTORY_POINTS: u32 = 1000;

/// One recorded observation row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Observation {
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<i64>,
    pub name: String,
}

struct HistoryInner {
    conn: Connection,
    last_recorded: HashMap<String, i64>,
}

pub struct NodeHistoryDb {
    inner: Mutex<HistoryInner>,
    path: PathBuf,
    throttle_seconds: i64,
    retention_seconds: i64,
}

impl NodeHistoryDb {
    pub fn default_path() -> PathBuf {
        crate::paths::data_dir().join("maps_node_history.db")
    }

    pub fn open(path: &Path, throttle_seconds: i64, retention_seconds: i64) -> MapsResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                altitude REAL,
                network TEXT,
                snr REAL,
                battery INTEGER,
                name TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_obs_node_time
                ON observations (node_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_obs_time
                ON observations (timestamp);",
        )?;
        info!(path = %path.display(), "node history database ready");
        Ok(Self {
            inner: Mutex::new(HistoryInner {
                conn,
                last_recorded: HashMap::new(),
            }),
            path: path.to_path_buf(),
            throttle_seconds,
            retention_seconds,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an observation unless throttled. Returns true when a row was
    /// inserted.
    #[allow(clippy::too_many_arguments)]
    pub fn record_observation(
        &self,
        node_id: &str,
        lat: f64,
        lon: f64,
        altitude: Option<f64>,
        network: &str,
        snr: Option<f64>,
        battery: Option<i64>,
        name: &str,
        timestamp: Option<i64>,
    ) -> MapsResult<bool> {
        let now = timestamp.unwrap_or_else(now_epoch);
        let mut inner = self.inner.lock();

        let last = inner.last_recorded.get(node_id).copied().unwrap_or(0);
        if now - last < self.throttle_seconds {
            return Ok(false);
        }

        inner.conn.execute(
            "INSERT INTO observations
                (node_id, timestamp, latitude, longitude, altitude, network, snr, battery, name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![node_id, now, lat, lon, altitude, network, snr, battery, name],
        )?;
        inner.last_recorded.insert(node_id.to_string(), now);
        Ok(true)
    }

    /// Trajectory as GeoJSON: a LineString, degraded to a Point for a single
    /// observation, or an empty collection when nothing is recorded.
    pub fn trajectory_geojson(
        &self,
        node_id: &str,
        since: Option<i64>,
        until: Option<i64>,
    ) -> MapsResult<Value> {
        let inner = self.inner.lock();
        let mut sql = String::from(
            "SELECT timestamp, latitude, longitude, altitude
             FROM observations WHERE node_id = ?1",
        );
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(node_id.to_string())];
        if let Some(since) = since {
            bound.push(Box::new(since));
            sql.push_str(&format!(" AND timestamp >= ?{}", bound.len()));
        }
        if let Some(until) = until {
            bound.push(Box::new(until));
            sql.push_str(&format!(" AND timestamp <= ?{}", bound.len()));
        }
        bound.push(Box::new(MAX_TRAJECTORY_POINTS));
        sql.push_str(&format!(" ORDER BY timestamp ASC, id ASC LIMIT ?{}", bound.len()));

        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bound.iter().map(|b| b.as_ref())), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, Option<f64>>(3)?,
            ))
        })?;

        let mut coordinates: Vec<Vec<f64>> = Vec::new();
        let mut timestamps: Vec<i64> = Vec::new();
        for row in rows {
            let (ts, lat, lon, alt) = row?;
            let mut coord = vec![lon, lat];
            if let Some(alt) = alt {
                coord.push(alt);
            }
            coordinates.push(coord);
            timestamps.push(ts);
        }

        if coordinates.is_empty() {
            return Ok(json!({"type": "FeatureCollection", "features": []}));
        }

        let geometry = if coordinates.len() == 1 {
            json!({"type": "Point", "coordinates": coordinates[0]})
        } else {
            json!({"type": "LineString", "coordinates": coordinates})
        };
        let time_span = if timestamps.len() > 1 {
            timestamps[timestamps.len() - 1] - timestamps[0]
        } else {
            0
        };
        Ok(json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": geometry,
                "properties": {
                    "node_id": node_id,
                    "point_count": coordinates.len(),
                    "first_seen": timestamps.first(),
                    "last_seen": timestamps.last(),
                    "time_span_seconds": time_span,
                }
            }]
        }))
    }

    /// The most recent `limit` observations for a node, reported in
    /// `(timestamp ASC, id ASC)` order.
    pub fn node_history(
        &self,
        node_id: &str,
        since: Option<i64>,
        limit: u32,
    ) -> MapsResult<Vec<Observation>> {
        let inner = self.inner.lock();
        let since = since.unwrap_or(0);
        let mut stmt = inner.conn.prepare(
            "SELECT timestamp, latitude, longitude, altitude, network, snr, battery, name
             FROM observations
             WHERE node_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC, id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![node_id, since, limit], |row| {
            Ok(Observation {
                timestamp: row.get(0)?,
                latitude: row.get(1)?,
                longitude: row.get(2)?,
                altitude: row.get(3)?,
                network: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                snr: row.get(5)?,
                battery: row.get(6)?,
                name: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            })
        })?;
        let mut observations = rows.collect::<Result<Vec<_>, _>>()?;
        observations.reverse();
        Ok(observations)
    }

    /// All tracked nodes with observation counts and time ranges.
    pub fn tracked_nodes(&self) -> MapsResult<Vec<Value>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT node_id, COUNT(*), MIN(timestamp), MAX(timestamp)
             FROM observations GROUP BY node_id ORDER BY MAX(timestamp) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(json!({
                "node_id": row.get::<_, String>(0)?,
                "observation_count": row.get::<_, i64>(1)?,
                "first_seen": row.get::<_, i64>(2)?,
                "last_seen": row.get::<_, i64>(3)?,
            }))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(MapsError::from)
    }

    /// Network state at a point in time: for every node, the latest
    /// observation at or before `timestamp`. Ties on the timestamp column are
    /// broken by the monotonic primary key, never the bare timestamp, so a
    /// node can never appear twice.
    pub fn snapshot(&self, timestamp: i64) -> MapsResult<Value> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT o.node_id, o.timestamp, o.latitude, o.longitude,
                    o.altitude, o.network, o.snr, o.battery, o.name
             FROM observations o
             INNER JOIN (
                 SELECT MAX(id) AS max_id
                 FROM observations
                 WHERE timestamp <= ?1
                 GROUP BY node_id
             ) latest ON o.id = latest.max_id",
        )?;
        let rows = stmt.query_map(params![timestamp], |row| {
            let node_id: String = row.get(0)?;
            let ts: i64 = row.get(1)?;
            let lat: f64 = row.get(2)?;
            let lon: f64 = row.get(3)?;
            let altitude: Option<f64> = row.get(4)?;
            let network: Option<String> = row.get(5)?;
            let snr: Option<f64> = row.get(6)?;
            let battery: Option<i64> = row.get(7)?;
            let name: Option<String> = row.get(8)?;

            let mut coord = vec![lon, lat];
            if let Some(alt) = altitude {
                coord.push(alt);
            }
            let mut props = json!({
                "id": node_id.clone(),
                "name": name.filter(|n| !n.is_empty()).unwrap_or_else(|| node_id.clone()),
                "network": network.filter(|n| !n.is_empty()).unwrap_or_else(|| "unknown".into()),
                "last_seen": ts,
            });
            if let Some(snr) = snr {
                props["snr"] = json!(snr);
            }
            if let Some(battery) = battery {
                props["battery"] = json!(battery);
            }
            if let Some(alt) = altitude {
                props["altitude"] = json!(alt);
            }
            Ok(json!({
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": coord},
                "properties": props,
            }))
        })?;

        let features: Vec<Value> = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(json!({
            "type": "FeatureCollection",
            "features": features,
            "properties": {
                "snapshot_time": timestamp,
                "node_count": features.len(),
            }
        }))
    }

    /// Observation density grid for heatmap rendering.
    pub fn density_points(
        &self,
        since: Option<i64>,
        until: Option<i64>,
        precision: u32,
        network: Option<&str>,
    ) -> MapsResult<Vec<(f64, f64, i64)>> {
        let inner = self.inner.lock();
        let mut sql = String::from(
            "SELECT ROUND(latitude, ?1) AS lat, ROUND(longitude, ?1) AS lon, COUNT(*) AS cnt
             FROM observations WHERE 1=1",
        );
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(precision)];
        if let Some(since) = since {
            bound.push(Box::new(since));
            sql.push_str(&format!(" AND timestamp >= ?{}", bound.len()));
        }
        if let Some(until) = until {
            bound.push(Box::new(until));
            sql.push_str(&format!(" AND timestamp <= ?{}", bound.len()));
        }
        if let Some(network) = network {
            bound.push(Box::new(network.to_string()));
            sql.push_str(&format!(" AND network = ?{}", bound.len()));
        }
        sql.push_str(" GROUP BY lat, lon ORDER BY cnt DESC");

        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(bound.iter().map(|b| b.as_ref())),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(MapsError::from)
    }

    /// Delete observations older than the cutoff. Returns rows removed.
    pub fn prune_old_data(&self, before_timestamp: Option<i64>) -> MapsResult<usize> {
        let cutoff = before_timestamp.unwrap_or_else(|| now_epoch() - self.retention_seconds);
        let inner = self.inner.lock();
        let deleted = inner
            .conn
            .execute("DELETE FROM observations WHERE timestamp < ?1", params![cutoff])?;
        if deleted > 0 {
            info!(deleted, "pruned old node history observations");
        }
        Ok(deleted)
    }

    pub fn observation_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .conn
            .query_row("SELECT COUNT(*) FROM observations", [], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .ok()
            .flatten()
            .unwrap_or(0) as usize
    }

    pub fn node_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .conn
            .query_row("SELECT COUNT(DISTINCT node_id) FROM observations", [], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .ok()
            .flatten()
            .unwrap_or(0) as usize
    }

    /// Read-only query hook for the analytics module. Returns rows as JSON
    /// arrays; statements stay parameterized.
    pub fn execute_read(
        &self,
        sql: &str,
        bound: &[&dyn rusqlite::ToSql],
    ) -> MapsResult<Vec<Vec<Value>>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(sql)?;
        let column_count = stmt.column_count();
        let rows = stmt.query_map(rusqlite::params_from_iter(bound.iter().copied()), |row| {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value = match row.get_ref(i)? {
                    rusqlite::types::ValueRef::Null => Value::Null,
                    rusqlite::types::ValueRef::Integer(v) => json!(v),
                    rusqlite::types::ValueRef::Real(v) => json!(v),
                    rusqlite::types::ValueRef::Text(t) => {
                        json!(String::from_utf8_lossy(t).to_string())
                    }
                    rusqlite::types::ValueRef::Blob(_) => Value::Null,
                };
                values.push(value);
            }
            Ok(values)
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(MapsError::from)
    }

    pub fn close(self) {
        debug!("node history database closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_db() -> (tempfile::TempDir, NodeHistoryDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = NodeHistoryDb::open(&dir.path().join("history.db"), 60, DEFAULT_RETENTION_SECONDS)
            .unwrap();
        (dir, db)
    }

    fn record(db: &NodeHistoryDb, node: &str, ts: i64, lat: f64, lon: f64) -> bool {
        db.record_observation(node, lat, lon, None, "meshtastic", None, None, "", Some(ts))
            .unwrap()
    }

    #[test]
    fn test_throttle_suppresses_rapid_writes() {
        let (_dir, db) = open_test_db();
        assert!(record(&db, "!aa", 1000, 40.0, -105.0));
        assert!(!record(&db, "!aa", 1030, 40.1, -105.1));
        assert_eq!(db.observation_count(), 1);
        assert!(record(&db, "!aa", 1060, 40.2, -105.2));
        assert_eq!(db.observation_count(), 2);
    }

    #[test]
    fn test_trajectory_line_string() {
        let (_dir, db) = open_test_db();
        record(&db, "!aa", 100, 40.0, -105.0);
        record(&db, "!aa", 200, 40.1, -105.1);
        record(&db, "!aa", 300, 40.2, -105.2);

        let doc = db.trajectory_geojson("!aa", None, None).unwrap();
        let feature = &doc["features"][0];
        assert_eq!(feature["geometry"]["type"], "LineString");
        assert_eq!(feature["properties"]["point_count"], 3);
        assert_eq!(feature["properties"]["time_span_seconds"], 200);

        // Bounded window.
        let doc = db.trajectory_geojson("!aa", Some(150), Some(250)).unwrap();
        assert_eq!(doc["features"][0]["geometry"]["type"], "Point");
    }

    #[test]
    fn test_snapshot_tie_break_by_row_id() {
        let (_dir, db) = open_test_db();
        record(&db, "!a", 100, 40.0, -105.0);
        record(&db, "!a", 200, 40.1, -105.1);
        record(&db, "!a", 300, 40.2, -105.2);
        record(&db, "!b", 150, 41.0, -104.0);
        record(&db, "!b", 250, 41.1, -104.1);

        let snapshot = db.snapshot(220).unwrap();
        let features = snapshot["features"].as_array().unwrap();
        assert_eq!(features.len(), 2);
        let by_id: HashMap<&str, i64> = features
            .iter()
            .map(|f| {
                (
                    f["properties"]["id"].as_str().unwrap(),
                    f["properties"]["last_seen"].as_i64().unwrap(),
                )
            })
            .collect();
        assert_eq!(by_id["!a"], 200);
        assert_eq!(by_id["!b"], 150);
    }

    #[test]
    fn test_node_history_order_and_limit() {
        let (_dir, db) = open_test_db();
        for i in 0..5 {
            record(&db, "!aa", 100 + i * 100, 40.0, -105.0);
        }
        // The three most recent observations, ascending by time.
        let history = db.node_history("!aa", None, 3).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].timestamp, 300);
        assert_eq!(history[2].timestamp, 500);
    }

    #[test]
    fn test_prune_old_data() {
        let (_dir, db) = open_test_db();
        record(&db, "!aa", 100, 40.0, -105.0);
        record(&db, "!aa", 5000, 40.0, -105.0);
        let deleted = db.prune_old_data(Some(1000)).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.observation_count(), 1);
    }

    #[test]
    fn test_tracked_nodes() {
        let (_dir, db) = open_test_db();
        record(&db, "!aa", 100, 40.0, -105.0);
        record(&db, "!aa", 200, 40.0, -105.0);
        record(&db, "!bb", 150, 41.0, -104.0);
        let nodes = db.tracked_nodes().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["node_id"], "!aa"); // most recent last_seen first
        assert_eq!(nodes[0]["observation_count"], 2);
    }

    #[test]
    fn test_execute_read_rows() {
        let (_dir, db) = open_test_db();
        record(&db, "!aa", 100, 40.0, -105.0);
        let rows = db
            .execute_read(
                "SELECT node_id, timestamp FROM observations WHERE timestamp >= ?1",
                &[&50i64],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], "!aa");
        assert_eq!(rows[0][1], 100);
    }
}
