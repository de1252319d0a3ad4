use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use jobline_core::error::{BatchError, Result};
use jobline_core::records::{JobExecution, JobInstance, JobStatus, StepExecution, StepStatus};
use jobline_core::status::BatchStatus;
use jobline_core::traits::PersistenceService;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS job_instances (
        instance_id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_name TEXT NOT NULL,
        definition_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_instances_name ON job_instances(job_name);

    CREATE TABLE IF NOT EXISTS job_executions (
        execution_id INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_id INTEGER NOT NULL REFERENCES job_instances(instance_id),
        job_name TEXT NOT NULL,
        batch_status TEXT NOT NULL,
        exit_status TEXT,
        create_time TEXT NOT NULL,
        start_time TEXT,
        end_time TEXT,
        last_updated TEXT NOT NULL,
        parameters TEXT NOT NULL DEFAULT '{}'
    );

    CREATE INDEX IF NOT EXISTS idx_executions_instance ON job_executions(instance_id);

    CREATE TABLE IF NOT EXISTS step_executions (
        step_execution_id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_execution_id INTEGER NOT NULL REFERENCES job_executions(execution_id),
        step_name TEXT NOT NULL,
        batch_status TEXT NOT NULL,
        exit_status TEXT,
        metrics TEXT NOT NULL DEFAULT '{}',
        persistent_user_data TEXT,
        start_time TEXT,
        end_time TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_step_executions_job ON step_executions(job_execution_id);

    CREATE TABLE IF NOT EXISTS job_status (
        instance_id INTEGER PRIMARY KEY,
        job_name TEXT NOT NULL,
        batch_status TEXT NOT NULL,
        exit_status TEXT,
        latest_execution_id INTEGER,
        current_step TEXT,
        restart_on TEXT
    );

    CREATE TABLE IF NOT EXISTS step_status (
        instance_id INTEGER NOT NULL,
        step_name TEXT NOT NULL,
        step_execution_id INTEGER NOT NULL,
        batch_status TEXT NOT NULL,
        exit_status TEXT,
        start_count INTEGER NOT NULL DEFAULT 1,
        persistent_user_data TEXT,
        PRIMARY KEY (instance_id, step_name)
    );";

const EXECUTION_COLUMNS: &str = "execution_id, instance_id, job_name, batch_status, exit_status, \
     create_time, start_time, end_time, last_updated, parameters";

const STEP_EXECUTION_COLUMNS: &str = "step_execution_id, job_execution_id, step_name, \
     batch_status, exit_status, metrics, persistent_user_data, start_time, end_time";

/// SQLite-backed persistence; records survive process restarts.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BatchError::Persistence(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets readers proceed while an execution is writing
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| BatchError::Persistence(e.to_string()))
    }
}

fn db_err(e: rusqlite::Error) -> BatchError {
    BatchError::Persistence(e.to_string())
}

fn parse_status(idx: usize, value: String) -> rusqlite::Result<BatchStatus> {
    value
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().map(parse_time)
}

fn parse_opt_json(value: Option<String>) -> Option<serde_json::Value> {
    value.and_then(|s| serde_json::from_str(&s).ok())
}

fn to_opt_json(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<JobInstance> {
    let created_at: String = row.get(3)?;
    Ok(JobInstance {
        instance_id: row.get::<_, i64>(0)? as u64,
        job_name: row.get(1)?,
        definition_json: row.get(2)?,
        created_at: parse_time(&created_at),
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<JobExecution> {
    let create_time: String = row.get(5)?;
    let last_updated: String = row.get(8)?;
    let parameters: String = row.get(9)?;
    Ok(JobExecution {
        execution_id: row.get::<_, i64>(0)? as u64,
        instance_id: row.get::<_, i64>(1)? as u64,
        job_name: row.get(2)?,
        batch_status: parse_status(3, row.get(3)?)?,
        exit_status: row.get(4)?,
        create_time: parse_time(&create_time),
        start_time: parse_opt_time(row.get(6)?),
        end_time: parse_opt_time(row.get(7)?),
        last_updated: parse_time(&last_updated),
        parameters: serde_json::from_str(&parameters).unwrap_or_default(),
    })
}

fn step_execution_from_row(row: &Row<'_>) -> rusqlite::Result<StepExecution> {
    let metrics: String = row.get(5)?;
    Ok(StepExecution {
        step_execution_id: row.get::<_, i64>(0)? as u64,
        job_execution_id: row.get::<_, i64>(1)? as u64,
        step_name: row.get(2)?,
        batch_status: parse_status(3, row.get(3)?)?,
        exit_status: row.get(4)?,
        metrics: serde_json::from_str(&metrics).unwrap_or_default(),
        persistent_user_data: parse_opt_json(row.get(6)?),
        start_time: parse_opt_time(row.get(7)?),
        end_time: parse_opt_time(row.get(8)?),
    })
}

impl PersistenceService for SqliteStore {
    fn create_job_instance(&self, job_name: &str, definition_json: &str) -> Result<JobInstance> {
        let conn = self.lock()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO job_instances (job_name, definition_json, created_at) VALUES (?1, ?2, ?3)",
            params![job_name, definition_json, created_at.to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(JobInstance {
            instance_id: conn.last_insert_rowid() as u64,
            job_name: job_name.to_string(),
            definition_json: definition_json.to_string(),
            created_at,
        })
    }

    fn job_instance(&self, instance_id: u64) -> Result<JobInstance> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT instance_id, job_name, definition_json, created_at
             FROM job_instances WHERE instance_id = ?1",
            params![instance_id as i64],
            instance_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| BatchError::NoSuchJobInstance(instance_id.to_string()))
    }

    fn job_instance_count(&self, job_name: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM job_instances WHERE job_name = ?1",
                params![job_name],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }

    fn job_instances(&self, job_name: &str) -> Result<Vec<JobInstance>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT instance_id, job_name, definition_json, created_at
                 FROM job_instances WHERE job_name = ?1 ORDER BY instance_id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![job_name], instance_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn job_names(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT job_name FROM job_instances ORDER BY job_name")
            .map_err(db_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db_err)
    }

    fn create_job_execution(
        &self,
        instance_id: u64,
        parameters: &HashMap<String, String>,
    ) -> Result<JobExecution> {
        let conn = self.lock()?;
        let job_name: String = conn
            .query_row(
                "SELECT job_name FROM job_instances WHERE instance_id = ?1",
                params![instance_id as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| BatchError::NoSuchJobInstance(instance_id.to_string()))?;

        let now = Utc::now();
        let params_json = serde_json::to_string(parameters)?;
        conn.execute(
            "INSERT INTO job_executions
                 (instance_id, job_name, batch_status, create_time, last_updated, parameters)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
            params![
                instance_id as i64,
                job_name,
                BatchStatus::Starting.as_str(),
                now.to_rfc3339(),
                params_json,
            ],
        )
        .map_err(db_err)?;

        Ok(JobExecution {
            execution_id: conn.last_insert_rowid() as u64,
            instance_id,
            job_name,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            create_time: now,
            start_time: None,
            end_time: None,
            last_updated: now,
            parameters: parameters.clone(),
        })
    }

    fn job_execution(&self, execution_id: u64) -> Result<JobExecution> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM job_executions WHERE execution_id = ?1",
                EXECUTION_COLUMNS
            ),
            params![execution_id as i64],
            execution_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or(BatchError::NoSuchJobExecution(execution_id))
    }

    fn job_executions(&self, instance_id: u64) -> Result<Vec<JobExecution>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM job_executions WHERE instance_id = ?1 ORDER BY execution_id",
                EXECUTION_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![instance_id as i64], execution_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn update_batch_status(
        &self,
        execution_id: u64,
        status: BatchStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let ts = at.to_rfc3339();
        let sql = match status {
            BatchStatus::Started => {
                "UPDATE job_executions SET batch_status = ?1, last_updated = ?2, start_time = ?2
                 WHERE execution_id = ?3"
            }
            BatchStatus::Completed | BatchStatus::Stopped | BatchStatus::Failed => {
                "UPDATE job_executions SET batch_status = ?1, last_updated = ?2, end_time = ?2
                 WHERE execution_id = ?3"
            }
            _ => {
                "UPDATE job_executions SET batch_status = ?1, last_updated = ?2
                 WHERE execution_id = ?3"
            }
        };
        let updated = conn
            .execute(sql, params![status.as_str(), ts, execution_id as i64])
            .map_err(db_err)?;
        if updated == 0 {
            return Err(BatchError::NoSuchJobExecution(execution_id));
        }
        Ok(())
    }

    fn update_exit_status(
        &self,
        execution_id: u64,
        exit_status: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE job_executions SET exit_status = ?1, last_updated = ?2
                 WHERE execution_id = ?3",
                params![exit_status, at.to_rfc3339(), execution_id as i64],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(BatchError::NoSuchJobExecution(execution_id));
        }
        Ok(())
    }

    fn create_job_status(&self, instance_id: u64, job_name: &str) -> Result<JobStatus> {
        let status = JobStatus::new(instance_id, job_name);
        self.update_job_status(&status)?;
        Ok(status)
    }

    fn job_status(&self, instance_id: u64) -> Result<Option<JobStatus>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT instance_id, job_name, batch_status, exit_status, latest_execution_id,
                    current_step, restart_on
             FROM job_status WHERE instance_id = ?1",
            params![instance_id as i64],
            |row| {
                Ok(JobStatus {
                    instance_id: row.get::<_, i64>(0)? as u64,
                    job_name: row.get(1)?,
                    batch_status: parse_status(2, row.get(2)?)?,
                    exit_status: row.get(3)?,
                    latest_execution_id: row.get::<_, Option<i64>>(4)?.map(|id| id as u64),
                    current_step: row.get(5)?,
                    restart_on: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn update_job_status(&self, status: &JobStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO job_status
                 (instance_id, job_name, batch_status, exit_status, latest_execution_id,
                  current_step, restart_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                status.instance_id as i64,
                status.job_name,
                status.batch_status.as_str(),
                status.exit_status,
                status.latest_execution_id.map(|id| id as i64),
                status.current_step,
                status.restart_on,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn create_step_status(
        &self,
        instance_id: u64,
        step_name: &str,
        step_execution_id: u64,
    ) -> Result<StepStatus> {
        let status = StepStatus::new(instance_id, step_name, step_execution_id);
        self.update_step_status(&status)?;
        Ok(status)
    }

    fn step_status(&self, instance_id: u64, step_name: &str) -> Result<Option<StepStatus>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT instance_id, step_name, step_execution_id, batch_status, exit_status,
                    start_count, persistent_user_data
             FROM step_status WHERE instance_id = ?1 AND step_name = ?2",
            params![instance_id as i64, step_name],
            |row| {
                Ok(StepStatus {
                    instance_id: row.get::<_, i64>(0)? as u64,
                    step_name: row.get(1)?,
                    step_execution_id: row.get::<_, i64>(2)? as u64,
                    batch_status: parse_status(3, row.get(3)?)?,
                    exit_status: row.get(4)?,
                    start_count: row.get::<_, i64>(5)? as u32,
                    persistent_user_data: parse_opt_json(row.get(6)?),
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn update_step_status(&self, status: &StepStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO step_status
                 (instance_id, step_name, step_execution_id, batch_status, exit_status,
                  start_count, persistent_user_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                status.instance_id as i64,
                status.step_name,
                status.step_execution_id as i64,
                status.batch_status.as_str(),
                status.exit_status,
                status.start_count as i64,
                to_opt_json(&status.persistent_user_data),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn create_step_execution(
        &self,
        job_execution_id: u64,
        step_name: &str,
    ) -> Result<StepExecution> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO step_executions (job_execution_id, step_name, batch_status)
             VALUES (?1, ?2, ?3)",
            params![
                job_execution_id as i64,
                step_name,
                BatchStatus::Starting.as_str()
            ],
        )
        .map_err(db_err)?;
        Ok(StepExecution {
            step_execution_id: conn.last_insert_rowid() as u64,
            job_execution_id,
            step_name: step_name.to_string(),
            batch_status: BatchStatus::Starting,
            exit_status: None,
            metrics: Default::default(),
            persistent_user_data: None,
            start_time: None,
            end_time: None,
        })
    }

    fn update_step_execution(&self, execution: &StepExecution) -> Result<()> {
        let conn = self.lock()?;
        let metrics = serde_json::to_string(&execution.metrics)?;
        let updated = conn
            .execute(
                "UPDATE step_executions
                 SET batch_status = ?1, exit_status = ?2, metrics = ?3,
                     persistent_user_data = ?4, start_time = ?5, end_time = ?6
                 WHERE step_execution_id = ?7",
                params![
                    execution.batch_status.as_str(),
                    execution.exit_status,
                    metrics,
                    to_opt_json(&execution.persistent_user_data),
                    execution.start_time.map(|t| t.to_rfc3339()),
                    execution.end_time.map(|t| t.to_rfc3339()),
                    execution.step_execution_id as i64,
                ],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(BatchError::Persistence(format!(
                "no step execution {}",
                execution.step_execution_id
            )));
        }
        Ok(())
    }

    fn step_executions(&self, job_execution_id: u64) -> Result<Vec<StepExecution>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM step_executions WHERE job_execution_id = ?1
                 ORDER BY step_execution_id",
                STEP_EXECUTION_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![job_execution_id as i64], step_execution_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
