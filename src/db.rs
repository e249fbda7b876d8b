use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::crm::models::*;
use crate::funnel::models::{Funnel, Step};

/// Async-safe handle to the dealflow database.
///
/// Wraps `Database` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Database>>,
}

impl DbHandle {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Database) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup, the CLI and
    /// tests only; never from a request handler.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Database>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct Database {
    conn: Connection,
}

const STAGE_COLUMNS: &str = "id, team_id, stage_key, label, color, position, kind";

const APPOINTMENT_COLUMNS: &str = "id, team_id, lead_name, lead_email, start_time, setter, closer, \
     cash_collected, mrr_amount, mrr_months, status, pipeline_stage, original_appointment_id, \
     rescheduled_to_id, reschedule_url, reschedule_count, calendar_invitee_ref, created_at, updated_at";

const TASK_COLUMNS: &str = "id, appointment_id, team_id, task_type, status, assigned_to, due_at, \
     attempts, notes, cancel_reason, created_at";

impl Database {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS team_pipeline_stages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    team_id INTEGER NOT NULL,
                    stage_key TEXT NOT NULL,
                    label TEXT NOT NULL,
                    color TEXT NOT NULL DEFAULT '#64748b',
                    position INTEGER NOT NULL DEFAULT 0,
                    kind TEXT NOT NULL DEFAULT 'custom',
                    UNIQUE(team_id, stage_key)
                );

                CREATE TABLE IF NOT EXISTS appointments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    team_id INTEGER NOT NULL,
                    lead_name TEXT NOT NULL,
                    lead_email TEXT NOT NULL DEFAULT '',
                    start_time TEXT NOT NULL,
                    setter TEXT,
                    closer TEXT,
                    cash_collected REAL NOT NULL DEFAULT 0,
                    mrr_amount REAL NOT NULL DEFAULT 0,
                    mrr_months INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'NEW',
                    pipeline_stage TEXT,
                    original_appointment_id INTEGER REFERENCES appointments(id) ON DELETE SET NULL,
                    rescheduled_to_id INTEGER REFERENCES appointments(id) ON DELETE SET NULL,
                    reschedule_url TEXT,
                    reschedule_count INTEGER NOT NULL DEFAULT 0,
                    calendar_invitee_ref TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS confirmation_tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    appointment_id INTEGER NOT NULL REFERENCES appointments(id) ON DELETE CASCADE,
                    team_id INTEGER NOT NULL,
                    task_type TEXT NOT NULL DEFAULT 'confirm',
                    status TEXT NOT NULL DEFAULT 'pending',
                    assigned_to TEXT,
                    due_at TEXT,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    notes TEXT NOT NULL DEFAULT '',
                    cancel_reason TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS activity_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    team_id INTEGER NOT NULL,
                    appointment_id INTEGER NOT NULL REFERENCES appointments(id) ON DELETE CASCADE,
                    action TEXT NOT NULL,
                    note TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS sales (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    team_id INTEGER NOT NULL,
                    appointment_id INTEGER NOT NULL,
                    lead_email TEXT NOT NULL,
                    closer TEXT,
                    amount REAL NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS mrr_commissions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    team_id INTEGER NOT NULL,
                    sale_id INTEGER NOT NULL REFERENCES sales(id) ON DELETE CASCADE,
                    lead_email TEXT NOT NULL,
                    closer TEXT,
                    month_number INTEGER NOT NULL,
                    amount REAL NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS funnels (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    steps TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_stages_team ON team_pipeline_stages(team_id, position);
                CREATE INDEX IF NOT EXISTS idx_appointments_team ON appointments(team_id);
                CREATE INDEX IF NOT EXISTS idx_appointments_closer ON appointments(team_id, closer);
                CREATE INDEX IF NOT EXISTS idx_tasks_appointment ON confirmation_tasks(appointment_id, status);
                CREATE INDEX IF NOT EXISTS idx_activity_appointment ON activity_logs(appointment_id);
                CREATE INDEX IF NOT EXISTS idx_sales_lead ON sales(team_id, lead_email);
                CREATE INDEX IF NOT EXISTS idx_mrr_lead ON mrr_commissions(team_id, lead_email);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Pipeline stages ───────────────────────────────────────────────

    /// Add a stage at the end of the team's board. A missing `kind` is
    /// inferred from the key and label once, here, and stored.
    pub fn create_stage(
        &self,
        team_id: i64,
        stage_key: &str,
        label: &str,
        color: &str,
        kind: Option<StageKind>,
    ) -> Result<PipelineStage> {
        let kind = kind.unwrap_or_else(|| StageKind::infer(stage_key, label));
        let max_pos: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM team_pipeline_stages WHERE team_id = ?1",
                params![team_id],
                |row| row.get(0),
            )
            .context("Failed to get max stage position")?;

        self.conn
            .execute(
                "INSERT INTO team_pipeline_stages (team_id, stage_key, label, color, position, kind)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![team_id, stage_key, label, color, max_pos + 1, kind.as_str()],
            )
            .with_context(|| format!("Failed to insert stage '{}'", stage_key))?;
        let id = self.conn.last_insert_rowid();
        self.get_stage(id)?.context("Stage not found after insert")
    }

    /// Insert the default stage set, skipping keys the team already has.
    pub fn seed_default_stages(&self, team_id: i64) -> Result<Vec<PipelineStage>> {
        let existing: Vec<String> = self
            .list_stages(team_id)?
            .into_iter()
            .map(|s| s.stage_key)
            .collect();
        for (key, label, color, kind) in default_stages() {
            if existing.iter().any(|k| k == key) {
                continue;
            }
            self.create_stage(team_id, key, label, color, Some(kind))?;
        }
        self.list_stages(team_id)
    }

    pub fn list_stages(&self, team_id: i64) -> Result<Vec<PipelineStage>> {
        let sql = format!(
            "SELECT {} FROM team_pipeline_stages WHERE team_id = ?1 ORDER BY position, id",
            STAGE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_stages")?;
        let rows = stmt
            .query_map(params![team_id], StageRow::from_row)
            .context("Failed to query stages")?;
        let mut stages = Vec::new();
        for row in rows {
            stages.push(row.context("Failed to read stage row")?.into_stage()?);
        }
        Ok(stages)
    }

    pub fn get_stage(&self, id: i64) -> Result<Option<PipelineStage>> {
        let sql = format!("SELECT {} FROM team_pipeline_stages WHERE id = ?1", STAGE_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], StageRow::from_row)
            .optional()
            .context("Failed to query stage")?;
        row.map(StageRow::into_stage).transpose()
    }

    pub fn update_stage(
        &self,
        id: i64,
        label: Option<&str>,
        color: Option<&str>,
        kind: Option<StageKind>,
        position: Option<i32>,
    ) -> Result<PipelineStage> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(l) = label {
            tx.execute(
                "UPDATE team_pipeline_stages SET label = ?1 WHERE id = ?2",
                params![l, id],
            )
            .context("Failed to update stage label")?;
        }
        if let Some(c) = color {
            tx.execute(
                "UPDATE team_pipeline_stages SET color = ?1 WHERE id = ?2",
                params![c, id],
            )
            .context("Failed to update stage color")?;
        }
        if let Some(k) = kind {
            tx.execute(
                "UPDATE team_pipeline_stages SET kind = ?1 WHERE id = ?2",
                params![k.as_str(), id],
            )
            .context("Failed to update stage kind")?;
        }
        if let Some(p) = position {
            tx.execute(
                "UPDATE team_pipeline_stages SET position = ?1 WHERE id = ?2",
                params![p, id],
            )
            .context("Failed to update stage position")?;
        }
        tx.commit().context("Failed to commit stage update")?;
        self.get_stage(id)?.context("Stage not found after update")
    }

    // ── Appointments ──────────────────────────────────────────────────

    pub fn create_appointment(&self, new: &NewAppointment) -> Result<Appointment> {
        self.conn
            .execute(
                "INSERT INTO appointments (team_id, lead_name, lead_email, start_time, setter, closer,
                     pipeline_stage, calendar_invitee_ref, original_appointment_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new.team_id,
                    new.lead_name,
                    new.lead_email,
                    new.start_time,
                    new.setter,
                    new.closer,
                    new.pipeline_stage,
                    new.calendar_invitee_ref,
                    new.original_appointment_id,
                ],
            )
            .context("Failed to insert appointment")?;
        let id = self.conn.last_insert_rowid();
        if let Some(original) = new.original_appointment_id {
            self.conn
                .execute(
                    "UPDATE appointments SET rescheduled_to_id = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![id, original],
                )
                .context("Failed to link rescheduled appointment")?;
        }
        self.get_appointment(id)?
            .context("Appointment not found after insert")
    }

    pub fn get_appointment(&self, id: i64) -> Result<Option<Appointment>> {
        let sql = format!("SELECT {} FROM appointments WHERE id = ?1", APPOINTMENT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], AppointmentRow::from_row)
            .optional()
            .context("Failed to query appointment")?;
        row.map(AppointmentRow::into_appointment).transpose()
    }

    pub fn list_appointments(&self, team_id: i64) -> Result<Vec<Appointment>> {
        let sql = format!(
            "SELECT {} FROM appointments WHERE team_id = ?1 ORDER BY start_time, id",
            APPOINTMENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_appointments")?;
        let rows = stmt
            .query_map(params![team_id], AppointmentRow::from_row)
            .context("Failed to query appointments")?;
        let mut appointments = Vec::new();
        for row in rows {
            appointments.push(row.context("Failed to read appointment row")?.into_appointment()?);
        }
        Ok(appointments)
    }

    /// Move an appointment to a stage, optionally overwriting its status.
    pub fn update_appointment_stage(
        &self,
        id: i64,
        stage_key: &str,
        status: Option<AppointmentStatus>,
    ) -> Result<Appointment> {
        let changed = match status {
            Some(s) => self.conn.execute(
                "UPDATE appointments SET pipeline_stage = ?1, status = ?2, updated_at = datetime('now') WHERE id = ?3",
                params![stage_key, s.as_str(), id],
            ),
            None => self.conn.execute(
                "UPDATE appointments SET pipeline_stage = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![stage_key, id],
            ),
        }
        .context("Failed to move appointment")?;
        if changed == 0 {
            anyhow::bail!("Appointment {} not found", id);
        }
        self.get_appointment(id)?
            .context("Appointment not found after move")
    }

    /// Overwrite the stage-related fields from a previously captured snapshot.
    pub fn restore_stage_fields(&self, id: i64, fields: &StageFields) -> Result<Appointment> {
        let changed = self
            .conn
            .execute(
                "UPDATE appointments SET pipeline_stage = ?1, status = ?2, cash_collected = ?3,
                     mrr_amount = ?4, mrr_months = ?5, reschedule_count = ?6,
                     updated_at = datetime('now')
                 WHERE id = ?7",
                params![
                    fields.pipeline_stage,
                    fields.status.as_str(),
                    fields.cash_collected,
                    fields.mrr_amount,
                    fields.mrr_months,
                    fields.reschedule_count,
                    id,
                ],
            )
            .context("Failed to restore appointment fields")?;
        if changed == 0 {
            anyhow::bail!("Appointment {} not found", id);
        }
        self.get_appointment(id)?
            .context("Appointment not found after restore")
    }

    pub fn set_reschedule_url(&self, id: i64, url: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE appointments SET reschedule_url = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![url, id],
            )
            .context("Failed to cache reschedule url")?;
        Ok(())
    }

    pub fn increment_reschedule_count(&self, id: i64) -> Result<Appointment> {
        self.conn
            .execute(
                "UPDATE appointments SET reschedule_count = reschedule_count + 1, updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to increment reschedule count")?;
        self.get_appointment(id)?
            .context("Appointment not found after reschedule count update")
    }

    pub fn set_revenue(
        &self,
        id: i64,
        cash_collected: f64,
        mrr_amount: f64,
        mrr_months: i32,
    ) -> Result<Appointment> {
        self.conn
            .execute(
                "UPDATE appointments SET cash_collected = ?1, mrr_amount = ?2, mrr_months = ?3,
                     updated_at = datetime('now')
                 WHERE id = ?4",
                params![cash_collected, mrr_amount, mrr_months, id],
            )
            .context("Failed to update appointment revenue")?;
        self.get_appointment(id)?
            .context("Appointment not found after revenue update")
    }

    // ── Activity log ──────────────────────────────────────────────────

    pub fn log_activity(
        &self,
        team_id: i64,
        appointment_id: i64,
        action: &str,
        note: &str,
    ) -> Result<ActivityLog> {
        self.conn
            .execute(
                "INSERT INTO activity_logs (team_id, appointment_id, action, note) VALUES (?1, ?2, ?3, ?4)",
                params![team_id, appointment_id, action, note],
            )
            .context("Failed to insert activity log")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, team_id, appointment_id, action, note, created_at FROM activity_logs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ActivityLog {
                        id: row.get(0)?,
                        team_id: row.get(1)?,
                        appointment_id: row.get(2)?,
                        action: row.get(3)?,
                        note: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .context("Activity log not found after insert")
    }

    pub fn list_activity(&self, appointment_id: i64) -> Result<Vec<ActivityLog>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, team_id, appointment_id, action, note, created_at
                 FROM activity_logs WHERE appointment_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_activity")?;
        let rows = stmt
            .query_map(params![appointment_id], |row| {
                Ok(ActivityLog {
                    id: row.get(0)?,
                    team_id: row.get(1)?,
                    appointment_id: row.get(2)?,
                    action: row.get(3)?,
                    note: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to query activity logs")?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.context("Failed to read activity row")?);
        }
        Ok(logs)
    }

    // ── Confirmation tasks ────────────────────────────────────────────

    /// Create a task on an appointment; the team is taken from the appointment.
    pub fn create_task_with_assignment(&self, new: &NewTask) -> Result<ConfirmationTask> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO confirmation_tasks (appointment_id, team_id, task_type, assigned_to, due_at, notes)
                 SELECT id, team_id, ?2, ?3, ?4, ?5 FROM appointments WHERE id = ?1",
                params![
                    new.appointment_id,
                    new.task_type.as_str(),
                    new.assigned_to,
                    new.due_at,
                    new.notes,
                ],
            )
            .context("Failed to insert confirmation task")?;
        if inserted == 0 {
            anyhow::bail!("Appointment {} not found", new.appointment_id);
        }
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, id: i64) -> Result<Option<ConfirmationTask>> {
        let sql = format!("SELECT {} FROM confirmation_tasks WHERE id = ?1", TASK_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], TaskRow::from_row)
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn list_tasks(&self, appointment_id: i64) -> Result<Vec<ConfirmationTask>> {
        let sql = format!(
            "SELECT {} FROM confirmation_tasks WHERE appointment_id = ?1 ORDER BY id",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(params![appointment_id], TaskRow::from_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    /// Cancel every pending task on an appointment and log why.
    /// Returns the number of tasks cancelled.
    pub fn cleanup_confirmation_tasks(&self, appointment_id: i64, reason: &str) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let cancelled = tx
            .execute(
                "UPDATE confirmation_tasks SET status = 'cancelled', cancel_reason = ?1
                 WHERE appointment_id = ?2 AND status = 'pending'",
                params![reason, appointment_id],
            )
            .context("Failed to cancel confirmation tasks")?;
        tx.execute(
            "INSERT INTO activity_logs (team_id, appointment_id, action, note)
             SELECT team_id, id, 'tasks_cleaned_up', ?2 FROM appointments WHERE id = ?1",
            params![appointment_id, format!("{} ({} cancelled)", reason, cancelled)],
        )
        .context("Failed to log task cleanup")?;
        tx.commit().context("Failed to commit task cleanup")?;
        Ok(cancelled)
    }

    /// Record an unanswered confirmation attempt, optionally pushing the due time.
    pub fn record_no_answer(
        &self,
        task_id: i64,
        note: &str,
        retry_at: Option<&str>,
    ) -> Result<ConfirmationTask> {
        let task = self
            .get_task(task_id)?
            .with_context(|| format!("Task {} not found", task_id))?;
        let notes = if task.notes.is_empty() {
            format!("No answer: {}", note)
        } else {
            format!("{}\nNo answer: {}", task.notes, note)
        };
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE confirmation_tasks SET attempts = attempts + 1, notes = ?1, due_at = COALESCE(?2, due_at)
             WHERE id = ?3",
            params![notes, retry_at, task_id],
        )
        .context("Failed to record no-answer attempt")?;
        tx.execute(
            "INSERT INTO activity_logs (team_id, appointment_id, action, note) VALUES (?1, ?2, 'no_answer', ?3)",
            params![task.team_id, task.appointment_id, note],
        )
        .context("Failed to log no-answer attempt")?;
        tx.commit().context("Failed to commit no-answer attempt")?;
        self.get_task(task_id)?
            .context("Task not found after no-answer update")
    }

    // ── Sales and commissions ─────────────────────────────────────────

    pub fn insert_sale(
        &self,
        team_id: i64,
        appointment_id: i64,
        lead_email: &str,
        closer: Option<&str>,
        amount: f64,
    ) -> Result<Sale> {
        self.conn
            .execute(
                "INSERT INTO sales (team_id, appointment_id, lead_email, closer, amount) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![team_id, appointment_id, lead_email, closer, amount],
            )
            .context("Failed to insert sale")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, team_id, appointment_id, lead_email, closer, amount, created_at FROM sales WHERE id = ?1",
                params![id],
                sale_from_row,
            )
            .context("Sale not found after insert")
    }

    pub fn insert_mrr_commission(
        &self,
        team_id: i64,
        sale_id: i64,
        lead_email: &str,
        closer: Option<&str>,
        month_number: i32,
        amount: f64,
    ) -> Result<MrrCommission> {
        self.conn
            .execute(
                "INSERT INTO mrr_commissions (team_id, sale_id, lead_email, closer, month_number, amount)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![team_id, sale_id, lead_email, closer, month_number, amount],
            )
            .context("Failed to insert mrr commission")?;
        Ok(MrrCommission {
            id: self.conn.last_insert_rowid(),
            team_id,
            sale_id,
            lead_email: lead_email.to_string(),
            closer: closer.map(str::to_string),
            month_number,
            amount,
        })
    }

    pub fn list_sales(&self, team_id: i64) -> Result<Vec<Sale>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, team_id, appointment_id, lead_email, closer, amount, created_at
                 FROM sales WHERE team_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_sales")?;
        let rows = stmt
            .query_map(params![team_id], sale_from_row)
            .context("Failed to query sales")?;
        let mut sales = Vec::new();
        for row in rows {
            sales.push(row.context("Failed to read sale row")?);
        }
        Ok(sales)
    }

    pub fn count_mrr_commissions(&self, team_id: i64, lead_email: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM mrr_commissions WHERE team_id = ?1 AND lead_email = ?2",
                params![team_id, lead_email],
                |row| row.get(0),
            )
            .context("Failed to count mrr commissions")?;
        Ok(count as usize)
    }

    pub fn delete_mrr_commissions_for_lead(&self, team_id: i64, lead_email: &str) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM mrr_commissions WHERE team_id = ?1 AND lead_email = ?2",
                params![team_id, lead_email],
            )
            .context("Failed to delete mrr commissions")
    }

    pub fn delete_sales_for_lead(&self, team_id: i64, lead_email: &str) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM sales WHERE team_id = ?1 AND lead_email = ?2",
                params![team_id, lead_email],
            )
            .context("Failed to delete sales")
    }

    // ── Funnels ───────────────────────────────────────────────────────

    pub fn create_funnel(&self, name: &str, steps: &[Step]) -> Result<Funnel> {
        let steps_json = serde_json::to_string(steps).context("Failed to serialize funnel steps")?;
        self.conn
            .execute(
                "INSERT INTO funnels (name, steps) VALUES (?1, ?2)",
                params![name, steps_json],
            )
            .context("Failed to insert funnel")?;
        let id = self.conn.last_insert_rowid();
        self.get_funnel(id)?.context("Funnel not found after insert")
    }

    pub fn get_funnel(&self, id: i64) -> Result<Option<Funnel>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, steps, created_at, updated_at FROM funnels WHERE id = ?1",
                params![id],
                FunnelRow::from_row,
            )
            .optional()
            .context("Failed to query funnel")?;
        row.map(FunnelRow::into_funnel).transpose()
    }

    pub fn list_funnels(&self) -> Result<Vec<Funnel>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, steps, created_at, updated_at FROM funnels ORDER BY id")
            .context("Failed to prepare list_funnels")?;
        let rows = stmt
            .query_map([], FunnelRow::from_row)
            .context("Failed to query funnels")?;
        let mut funnels = Vec::new();
        for row in rows {
            funnels.push(row.context("Failed to read funnel row")?.into_funnel()?);
        }
        Ok(funnels)
    }

    pub fn save_funnel(&self, funnel: &Funnel) -> Result<Funnel> {
        let steps_json =
            serde_json::to_string(&funnel.steps).context("Failed to serialize funnel steps")?;
        let changed = self
            .conn
            .execute(
                "UPDATE funnels SET name = ?1, steps = ?2, updated_at = datetime('now') WHERE id = ?3",
                params![funnel.name, steps_json, funnel.id],
            )
            .context("Failed to save funnel")?;
        if changed == 0 {
            anyhow::bail!("Funnel {} not found", funnel.id);
        }
        self.get_funnel(funnel.id)?
            .context("Funnel not found after save")
    }
}

fn sale_from_row(row: &Row<'_>) -> rusqlite::Result<Sale> {
    Ok(Sale {
        id: row.get(0)?,
        team_id: row.get(1)?,
        appointment_id: row.get(2)?,
        lead_email: row.get(3)?,
        closer: row.get(4)?,
        amount: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Intermediate row struct for stages before parsing `kind`.
struct StageRow {
    id: i64,
    team_id: i64,
    stage_key: String,
    label: String,
    color: String,
    position: i32,
    kind: String,
}

impl StageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            team_id: row.get(1)?,
            stage_key: row.get(2)?,
            label: row.get(3)?,
            color: row.get(4)?,
            position: row.get(5)?,
            kind: row.get(6)?,
        })
    }

    fn into_stage(self) -> Result<PipelineStage> {
        let kind = StageKind::from_str(&self.kind)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse stage kind")?;
        Ok(PipelineStage {
            id: self.id,
            team_id: self.team_id,
            stage_key: self.stage_key,
            label: self.label,
            color: self.color,
            position: self.position,
            kind,
        })
    }
}

/// Intermediate row struct for appointments before parsing `status`.
struct AppointmentRow {
    id: i64,
    team_id: i64,
    lead_name: String,
    lead_email: String,
    start_time: String,
    setter: Option<String>,
    closer: Option<String>,
    cash_collected: f64,
    mrr_amount: f64,
    mrr_months: i32,
    status: String,
    pipeline_stage: Option<String>,
    original_appointment_id: Option<i64>,
    rescheduled_to_id: Option<i64>,
    reschedule_url: Option<String>,
    reschedule_count: i32,
    calendar_invitee_ref: Option<String>,
    created_at: String,
    updated_at: String,
}

impl AppointmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            team_id: row.get(1)?,
            lead_name: row.get(2)?,
            lead_email: row.get(3)?,
            start_time: row.get(4)?,
            setter: row.get(5)?,
            closer: row.get(6)?,
            cash_collected: row.get(7)?,
            mrr_amount: row.get(8)?,
            mrr_months: row.get(9)?,
            status: row.get(10)?,
            pipeline_stage: row.get(11)?,
            original_appointment_id: row.get(12)?,
            rescheduled_to_id: row.get(13)?,
            reschedule_url: row.get(14)?,
            reschedule_count: row.get(15)?,
            calendar_invitee_ref: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn into_appointment(self) -> Result<Appointment> {
        let status = AppointmentStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse appointment status")?;
        Ok(Appointment {
            id: self.id,
            team_id: self.team_id,
            lead_name: self.lead_name,
            lead_email: self.lead_email,
            start_time: self.start_time,
            setter: self.setter,
            closer: self.closer,
            cash_collected: self.cash_collected,
            mrr_amount: self.mrr_amount,
            mrr_months: self.mrr_months,
            status,
            pipeline_stage: self.pipeline_stage,
            original_appointment_id: self.original_appointment_id,
            rescheduled_to_id: self.rescheduled_to_id,
            reschedule_url: self.reschedule_url,
            reschedule_count: self.reschedule_count,
            calendar_invitee_ref: self.calendar_invitee_ref,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct TaskRow {
    id: i64,
    appointment_id: i64,
    team_id: i64,
    task_type: String,
    status: String,
    assigned_to: Option<String>,
    due_at: Option<String>,
    attempts: i32,
    notes: String,
    cancel_reason: Option<String>,
    created_at: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            appointment_id: row.get(1)?,
            team_id: row.get(2)?,
            task_type: row.get(3)?,
            status: row.get(4)?,
            assigned_to: row.get(5)?,
            due_at: row.get(6)?,
            attempts: row.get(7)?,
            notes: row.get(8)?,
            cancel_reason: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_task(self) -> Result<ConfirmationTask> {
        let task_type = TaskType::from_str(&self.task_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task type")?;
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        Ok(ConfirmationTask {
            id: self.id,
            appointment_id: self.appointment_id,
            team_id: self.team_id,
            task_type,
            status,
            assigned_to: self.assigned_to,
            due_at: self.due_at,
            attempts: self.attempts,
            notes: self.notes,
            cancel_reason: self.cancel_reason,
            created_at: self.created_at,
        })
    }
}

struct FunnelRow {
    id: i64,
    name: String,
    steps: String,
    created_at: String,
    updated_at: String,
}

impl FunnelRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            steps: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_funnel(self) -> Result<Funnel> {
        let steps: Vec<Step> =
            serde_json::from_str(&self.steps).context("Failed to parse funnel steps JSON")?;
        Ok(Funnel {
            id: self.id,
            name: self.name,
            steps,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
