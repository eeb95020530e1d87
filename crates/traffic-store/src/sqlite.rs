//! SQLite-backed `IncidentStore` implementation with durable persistence.

use crate::{
    ensure_window, expiry_window, CorruptRow, ExpiredIncident, ExpirySweep, IncidentStore,
    IncidentStoreError, IncidentWindow, StartTimeBounds, StoreResult,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use traffic_types::merge::{decide_sighting, synthesized_end_time};
use traffic_types::{
    Geometry, Incident, IncidentEvent, PersistedIncident, SightingDecision, StoredPeak,
    TmcLocation, UpsertOutcome,
};

const INCIDENT_COLUMNS: &str = r#"
    id, category, geometry_type, coordinates, magnitude_of_delay, start_time, end_time,
    from_location, to_location, length, delay, road_numbers, time_validity,
    probability_of_occurrence, number_of_reports, last_report_time, events,
    country_code, table_number, table_version, direction, last_seen
"#;

/// Persistent SQLite store owning a single connection for its lifetime.
#[derive(Debug)]
pub struct SqliteIncidentStore {
    db_path: Option<PathBuf>,
    connection: Connection,
}

impl SqliteIncidentStore {
    /// Opens (or creates) the database at `path`, creating schema if needed.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connection = Connection::open(&db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        let store = Self {
            db_path: Some(db_path),
            connection,
        };
        store.initialize_schema()?;
        tracing::info!(db_path = %store.describe(), "incident store opened");
        Ok(store)
    }

    /// Opens a private in-memory database with the same schema.
    pub fn open_in_memory() -> StoreResult<Self> {
        let store = Self {
            db_path: None,
            connection: Connection::open_in_memory()?,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn describe(&self) -> String {
        self.db_path
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string())
    }

    fn initialize_schema(&self) -> StoreResult<()> {
        self.connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                category INTEGER NOT NULL,
                geometry_type TEXT NOT NULL,
                coordinates TEXT NOT NULL,
                magnitude_of_delay INTEGER NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NULL,
                from_location TEXT NULL,
                to_location TEXT NULL,
                length REAL NULL,
                delay REAL NULL,
                road_numbers TEXT NOT NULL,
                time_validity TEXT NULL,
                probability_of_occurrence TEXT NULL,
                number_of_reports INTEGER NOT NULL,
                last_report_time TEXT NULL,
                events TEXT NOT NULL,
                country_code TEXT NULL,
                table_number TEXT NULL,
                table_version TEXT NULL,
                direction TEXT NULL,
                last_seen TEXT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_incidents_start_time ON incidents (start_time);
            CREATE INDEX IF NOT EXISTS idx_incidents_end_time ON incidents (end_time);
            CREATE INDEX IF NOT EXISTS idx_incidents_open_last_seen
                ON incidents (last_seen) WHERE end_time IS NULL OR end_time = '';
            "#,
        )?;
        Ok(())
    }

    /// Refreshes query planner statistics; cheap enough to run once per day.
    pub fn optimize(&self) -> StoreResult<()> {
        self.connection.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }

    /// Closes the connection, surfacing any error from the final flush.
    pub fn close(self) -> StoreResult<()> {
        let description = self.describe();
        self.connection
            .close()
            .map_err(|(_, error)| IncidentStoreError::from(error))?;
        tracing::info!(db_path = %description, "incident store closed");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl IncidentStore for SqliteIncidentStore {
    fn record_sighting(
        &mut self,
        incident: &Incident,
        now: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome> {
        let transaction = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored: Option<(Option<f64>, Option<String>)> = transaction
            .query_row(
                "SELECT delay, end_time FROM incidents WHERE id = ?1",
                params![incident.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let decision = match stored {
            None => decide_sighting(None, incident),
            Some((delay, end_time)) => match option_timestamp_from_db(end_time.clone()) {
                Ok(end_time) => decide_sighting(Some(&StoredPeak { delay, end_time }), incident),
                Err(error) => {
                    // The stored peak is unreadable; only presence is recorded.
                    tracing::error!(
                        incident_id = %incident.id,
                        end_time = ?end_time,
                        %error,
                        "stored end_time is unparseable; refreshing last_seen only"
                    );
                    SightingDecision::Refresh
                }
            },
        };
        match decision {
            SightingDecision::Insert => {
                insert_incident(&transaction, incident, now)?;
            }
            SightingDecision::Escalate { end_time } => {
                overwrite_incident(&transaction, incident, end_time, now)?;
            }
            SightingDecision::Refresh => {
                transaction.execute(
                    "UPDATE incidents SET last_seen = ?1 WHERE id = ?2",
                    params![timestamp_to_db(now), incident.id],
                )?;
            }
        }
        transaction.commit()?;
        Ok(decision.outcome())
    }

    fn expire_stale_at(
        &mut self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ExpirySweep> {
        let (threshold, cutoff) = expiry_window(threshold, now)?;
        let cutoff = timestamp_to_db(cutoff);
        let transaction = self.connection.transaction()?;

        let candidates: Vec<(String, String, Option<String>)> = {
            let mut statement = transaction.prepare(
                r#"
                SELECT id, start_time, last_seen FROM incidents
                WHERE last_seen < ?1 AND (end_time IS NULL OR end_time = '')
                ORDER BY id ASC
                "#,
            )?;
            let rows = statement.query_map(params![cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let mut sweep = ExpirySweep::default();
        for (id, start_time, last_seen) in candidates {
            let parsed = timestamp_from_db(&start_time).and_then(|start_time| {
                Ok((start_time, option_timestamp_from_db(last_seen.clone())?))
            });
            let (start_time, last_seen) = match parsed {
                Ok(parsed) => parsed,
                Err(error) => {
                    tracing::error!(
                        incident_id = %id,
                        start_time = %start_time,
                        last_seen = ?last_seen,
                        %error,
                        "skipping incident with unparseable timestamps during expiry sweep"
                    );
                    sweep.corrupt_skipped += 1;
                    continue;
                }
            };

            let end_time = synthesized_end_time(start_time, last_seen, threshold);
            transaction.execute(
                "UPDATE incidents SET end_time = ?1 WHERE id = ?2 AND (end_time IS NULL OR end_time = '')",
                params![timestamp_to_db(end_time), id],
            )?;
            sweep.expired.push(ExpiredIncident { id, end_time });
        }
        transaction.commit()?;

        if !sweep.expired.is_empty() || sweep.corrupt_skipped > 0 {
            tracing::info!(
                expired = sweep.expired.len(),
                corrupt_skipped = sweep.corrupt_skipped,
                "marked ended incidents"
            );
        }
        Ok(sweep)
    }

    fn get_incident(&self, id: &str) -> StoreResult<Option<PersistedIncident>> {
        let row = self
            .connection
            .query_row(
                &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
                params![id],
                StoredRow::from_row,
            )
            .optional()?;
        row.map(|row| {
            row.decode()
                .map_err(|reason| IncidentStoreError::InvalidPersistedValue {
                    field: "incident",
                    value: format!("{id}: {reason}"),
                })
        })
        .transpose()
    }

    fn incident_count(&self) -> StoreResult<usize> {
        let count: i64 =
            self.connection
                .query_row("SELECT COUNT(*) FROM incidents", [], |row| row.get(0))?;
        usize::try_from(count).map_err(|_| IncidentStoreError::InvalidPersistedValue {
            field: "count",
            value: count.to_string(),
        })
    }

    fn start_time_bounds(&self) -> StoreResult<StartTimeBounds> {
        let (earliest, latest): (Option<String>, Option<String>) = self.connection.query_row(
            "SELECT MIN(start_time), MAX(start_time) FROM incidents",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StartTimeBounds {
            earliest: option_timestamp_from_db(earliest)?,
            latest: option_timestamp_from_db(latest)?,
        })
    }

    fn incidents_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<IncidentWindow> {
        ensure_window(start, end)?;
        let mut statement = self.connection.prepare(&format!(
            r#"
            SELECT {INCIDENT_COLUMNS} FROM incidents
            WHERE (start_time BETWEEN ?1 AND ?2) OR (end_time BETWEEN ?1 AND ?2)
            ORDER BY start_time ASC, id ASC
            "#
        ))?;
        let mut rows = statement.query(params![timestamp_to_db(start), timestamp_to_db(end)])?;

        let mut window = IncidentWindow::default();
        while let Some(row) = rows.next()? {
            let stored = StoredRow::from_row(row)?;
            let id = stored.id.clone();
            match stored.decode() {
                Ok(incident) => window.incidents.push(incident),
                Err(reason) => window.corrupt.push(CorruptRow { id, reason }),
            }
        }
        Ok(window)
    }
}

fn insert_incident(
    transaction: &Transaction<'_>,
    incident: &Incident,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let tmc = incident.tmc.clone().unwrap_or_default();
    transaction.execute(
        &format!(
            r#"
            INSERT INTO incidents ({INCIDENT_COLUMNS})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22)
            "#
        ),
        params![
            incident.id,
            incident.category,
            incident.geometry.kind(),
            incident.geometry.coordinates_json(),
            incident.magnitude_of_delay,
            timestamp_to_db(incident.start_time),
            option_timestamp_to_db(incident.end_time),
            incident.from_location,
            incident.to_location,
            incident.length,
            incident.delay,
            incident.road_numbers.join(","),
            incident.time_validity,
            incident.probability_of_occurrence,
            incident.number_of_reports,
            incident.last_report_time,
            serde_json::to_string(&incident.events)?,
            tmc.country_code,
            tmc.table_number,
            tmc.table_version,
            tmc.direction,
            timestamp_to_db(now),
        ],
    )?;
    Ok(())
}

fn overwrite_incident(
    transaction: &Transaction<'_>,
    incident: &Incident,
    end_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let tmc = incident.tmc.clone().unwrap_or_default();
    transaction.execute(
        r#"
        UPDATE incidents
        SET category = ?1, geometry_type = ?2, coordinates = ?3, magnitude_of_delay = ?4,
            start_time = ?5, end_time = ?6, from_location = ?7, to_location = ?8, length = ?9,
            delay = ?10, road_numbers = ?11, time_validity = ?12, probability_of_occurrence = ?13,
            number_of_reports = ?14, last_report_time = ?15, events = ?16, country_code = ?17,
            table_number = ?18, table_version = ?19, direction = ?20, last_seen = ?21
        WHERE id = ?22
        "#,
        params![
            incident.category,
            incident.geometry.kind(),
            incident.geometry.coordinates_json(),
            incident.magnitude_of_delay,
            timestamp_to_db(incident.start_time),
            option_timestamp_to_db(end_time),
            incident.from_location,
            incident.to_location,
            incident.length,
            incident.delay,
            incident.road_numbers.join(","),
            incident.time_validity,
            incident.probability_of_occurrence,
            incident.number_of_reports,
            incident.last_report_time,
            serde_json::to_string(&incident.events)?,
            tmc.country_code,
            tmc.table_number,
            tmc.table_version,
            tmc.direction,
            timestamp_to_db(now),
            incident.id,
        ],
    )?;
    Ok(())
}

/// Raw column values of one `incidents` row, before decoding.
struct StoredRow {
    id: String,
    category: i64,
    geometry_type: String,
    coordinates: String,
    magnitude_of_delay: i64,
    start_time: String,
    end_time: Option<String>,
    from_location: Option<String>,
    to_location: Option<String>,
    length: Option<f64>,
    delay: Option<f64>,
    road_numbers: String,
    time_validity: Option<String>,
    probability_of_occurrence: Option<String>,
    number_of_reports: i64,
    last_report_time: Option<String>,
    events: String,
    country_code: Option<String>,
    table_number: Option<String>,
    table_version: Option<String>,
    direction: Option<String>,
    last_seen: Option<String>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            category: row.get(1)?,
            geometry_type: row.get(2)?,
            coordinates: row.get(3)?,
            magnitude_of_delay: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
            from_location: row.get(7)?,
            to_location: row.get(8)?,
            length: row.get(9)?,
            delay: row.get(10)?,
            road_numbers: row.get(11)?,
            time_validity: row.get(12)?,
            probability_of_occurrence: row.get(13)?,
            number_of_reports: row.get(14)?,
            last_report_time: row.get(15)?,
            events: row.get(16)?,
            country_code: row.get(17)?,
            table_number: row.get(18)?,
            table_version: row.get(19)?,
            direction: row.get(20)?,
            last_seen: row.get(21)?,
        })
    }

    fn decode(self) -> Result<PersistedIncident, String> {
        let geometry = Geometry::from_stored(&self.geometry_type, &self.coordinates)?;
        let start_time = timestamp_from_db(&self.start_time)
            .map_err(|error| format!("start_time '{}': {error}", self.start_time))?;
        let end_time = option_timestamp_from_db(self.end_time)
            .map_err(|error| format!("end_time: {error}"))?;
        let last_seen = option_timestamp_from_db(self.last_seen)
            .map_err(|error| format!("last_seen: {error}"))?;
        let events: Vec<IncidentEvent> = serde_json::from_str(&self.events)
            .map_err(|error| format!("events: {error}"))?;
        let tmc = if self.country_code.is_some()
            || self.table_number.is_some()
            || self.table_version.is_some()
            || self.direction.is_some()
        {
            Some(TmcLocation {
                country_code: self.country_code,
                table_number: self.table_number,
                table_version: self.table_version,
                direction: self.direction,
            })
        } else {
            None
        };
        let road_numbers = self
            .road_numbers
            .split(',')
            .map(str::trim)
            .filter(|road| !road.is_empty())
            .map(str::to_string)
            .collect();

        Ok(PersistedIncident {
            incident: Incident {
                id: self.id,
                category: self.category,
                geometry,
                magnitude_of_delay: self.magnitude_of_delay,
                start_time,
                end_time,
                from_location: self.from_location,
                to_location: self.to_location,
                length: self.length,
                delay: self.delay,
                road_numbers,
                time_validity: self.time_validity,
                probability_of_occurrence: self.probability_of_occurrence,
                number_of_reports: self.number_of_reports,
                last_report_time: self.last_report_time,
                events,
                tmc,
            },
            last_seen,
        })
    }
}

/// Canonical stored form; fixed width so SQL string comparison is
/// chronological.
fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn option_timestamp_to_db(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp_to_db)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value
        .as_deref()
        .filter(|value| !value.is_empty())
        .map(timestamp_from_db)
        .transpose()
}
