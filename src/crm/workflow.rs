//! Pipeline stage transitions.
//!
//! A card move either commits straight away or asks the caller to collect
//! more input first (a dialog), depending on the kind of the target stage.
//! Dialog answers come back through the `resolve_*` methods, which perform
//! the commit. Every commit records a single-level undo snapshot per team.
//!
//! Store writes all go through [`StageWorkflow::guard_write`]: a failed write
//! produces exactly one error toast and one board reload request, then the
//! error is returned. Nothing is retried.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::calendar::CalendarClient;
use super::models::*;
use super::store::CrmStore;
use crate::errors::WorkflowError;

// ── Notifications ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Info,
    Error,
}

/// Where the workflow reports user-facing feedback for a team's board.
pub trait BoardNotifier: Send + Sync {
    fn toast(&self, team_id: i64, level: ToastLevel, message: &str);

    /// Ask every board for this team to discard local state and refetch.
    fn request_reload(&self, team_id: i64);

    fn appointment_changed(&self, appointment: &Appointment);
}

// ── Outcomes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "dialog", rename_all = "snake_case")]
pub enum DialogRequest {
    CloseDeal,
    RescheduleConfirm { url: String },
    FollowUp,
    DepositCollected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MoveOutcome {
    /// Target equals the current stage.
    NoOp,
    Committed {
        appointment: Appointment,
    },
    /// The move is already stored; the dialog collects follow-on data.
    CommittedWithDialog {
        appointment: Appointment,
        dialog: DialogRequest,
    },
    /// Nothing stored yet; the dialog's answer performs the commit.
    DialogRequired {
        appointment_id: i64,
        target_stage: String,
        dialog: DialogRequest,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageSnapshot {
    pub appointment_id: i64,
    pub team_id: i64,
    pub lead_email: String,
    pub previous: StageFields,
    pub moved_to_stage: String,
    pub moved_to: StageKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UndoOutcome {
    NothingToUndo,
    /// The last move created sale/commission rows; ask before deleting them.
    ConfirmationRequired { snapshot: StageSnapshot },
    Restored {
        appointment: Appointment,
        commissions_deleted: usize,
        sales_deleted: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpResolution {
    pub appointment: Appointment,
    pub task: Option<ConfirmationTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseDealResult {
    pub appointment: Appointment,
    pub sale: Sale,
    pub commissions: Vec<MrrCommission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoubleBookResolution {
    pub kept: Appointment,
    pub cancelled: Appointment,
}

// ── Undo ledger ───────────────────────────────────────────────────────

/// Last committed move per team.
#[derive(Default)]
pub struct UndoLedger {
    snapshots: Mutex<HashMap<i64, StageSnapshot>>,
}

impl UndoLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, StageSnapshot>> {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, snapshot: StageSnapshot) {
        self.lock().insert(snapshot.team_id, snapshot);
    }

    pub fn peek(&self, team_id: i64) -> Option<StageSnapshot> {
        self.lock().get(&team_id).cloned()
    }

    pub fn take(&self, team_id: i64) -> Option<StageSnapshot> {
        self.lock().remove(&team_id)
    }
}

// ── Workflow ──────────────────────────────────────────────────────────

pub struct StageWorkflow {
    store: Arc<dyn CrmStore>,
    calendar: Arc<dyn CalendarClient>,
    notifier: Arc<dyn BoardNotifier>,
    undo: UndoLedger,
}

impl StageWorkflow {
    pub fn new(
        store: Arc<dyn CrmStore>,
        calendar: Arc<dyn CalendarClient>,
        notifier: Arc<dyn BoardNotifier>,
    ) -> Self {
        Self {
            store,
            calendar,
            notifier,
            undo: UndoLedger::new(),
        }
    }

    pub fn undo_ledger(&self) -> &UndoLedger {
        &self.undo
    }

    /// Load an appointment. Lookups carry no team context, so failures are
    /// returned to the caller without a board notification.
    pub async fn load(&self, appointment_id: i64) -> Result<Appointment, WorkflowError> {
        self.store
            .get_appointment(appointment_id)
            .await
            .map_err(|source| WorkflowError::Remote {
                action: "load appointment".into(),
                source,
            })?
            .ok_or(WorkflowError::AppointmentNotFound { id: appointment_id })
    }

    /// Decide what moving `appointment` to `target_key` does.
    pub async fn move_card(
        &self,
        appointment: &Appointment,
        target_key: &str,
    ) -> Result<MoveOutcome, WorkflowError> {
        if appointment.pipeline_stage.as_deref() == Some(target_key) {
            return Ok(MoveOutcome::NoOp);
        }

        let stage = self.resolve_stage(appointment.team_id, target_key).await?;
        let dialog_required = |dialog| MoveOutcome::DialogRequired {
            appointment_id: appointment.id,
            target_stage: stage.stage_key.clone(),
            dialog,
        };

        match stage.kind {
            StageKind::Won => {
                let updated = self.commit(appointment, &stage).await?;
                Ok(MoveOutcome::CommittedWithDialog {
                    appointment: updated,
                    dialog: DialogRequest::CloseDeal,
                })
            }
            StageKind::Rescheduled => {
                let url = self.reschedule_url(appointment).await?;
                Ok(dialog_required(DialogRequest::RescheduleConfirm { url }))
            }
            StageKind::Cancelled | StageKind::NoShow => Ok(dialog_required(DialogRequest::FollowUp)),
            StageKind::Deposit => Ok(dialog_required(DialogRequest::DepositCollected)),
            _ => {
                let updated = self.commit(appointment, &stage).await?;
                Ok(MoveOutcome::Committed {
                    appointment: updated,
                })
            }
        }
    }

    /// Confirm a reschedule: commit the move and bump the reschedule count.
    pub async fn resolve_reschedule(
        &self,
        appointment_id: i64,
        target_key: &str,
    ) -> Result<Appointment, WorkflowError> {
        let appointment = self.load(appointment_id).await?;
        let stage = self
            .resolve_dialog_stage(&appointment, target_key, &[StageKind::Rescheduled])
            .await?;
        self.commit(&appointment, &stage).await?;
        let updated = self
            .guard_write(
                appointment.team_id,
                "update reschedule count",
                self.store.increment_reschedule_count(appointment.id),
            )
            .await?;
        self.notifier.appointment_changed(&updated);
        Ok(updated)
    }

    /// Confirm a cancellation or no-show with a reason, optionally scheduling
    /// a follow-up task for the closer (or the setter when there is none).
    pub async fn resolve_follow_up(
        &self,
        appointment_id: i64,
        target_key: &str,
        reason: &str,
        follow_up_at: Option<&str>,
    ) -> Result<FollowUpResolution, WorkflowError> {
        let appointment = self.load(appointment_id).await?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(self.precondition(
                appointment.team_id,
                WorkflowError::InvalidInput("A reason is required".into()),
            ));
        }
        let stage = self
            .resolve_dialog_stage(
                &appointment,
                target_key,
                &[StageKind::Cancelled, StageKind::NoShow],
            )
            .await?;

        let updated = self.commit(&appointment, &stage).await?;
        self.guard_write(
            appointment.team_id,
            "log follow-up reason",
            self.store
                .log_activity(appointment.team_id, appointment.id, "follow_up_reason", reason),
        )
        .await?;

        let task = match follow_up_at {
            Some(due_at) => {
                let new_task = NewTask {
                    appointment_id: appointment.id,
                    task_type: TaskType::FollowUp,
                    assigned_to: appointment.closer.clone().or(appointment.setter.clone()),
                    due_at: Some(due_at.to_string()),
                    notes: reason.to_string(),
                };
                let task = self
                    .guard_write(
                        appointment.team_id,
                        "create follow-up task",
                        self.store.create_task_with_assignment(&new_task),
                    )
                    .await?;
                Some(task)
            }
            None => None,
        };

        Ok(FollowUpResolution {
            appointment: updated,
            task,
        })
    }

    /// Commit a cancellation or no-show without recording a reason.
    pub async fn skip_follow_up(
        &self,
        appointment_id: i64,
        target_key: &str,
    ) -> Result<Appointment, WorkflowError> {
        let appointment = self.load(appointment_id).await?;
        let stage = self
            .resolve_dialog_stage(
                &appointment,
                target_key,
                &[StageKind::Cancelled, StageKind::NoShow],
            )
            .await?;
        self.commit(&appointment, &stage).await
    }

    /// Commit the move to the deposit stage, then record the deposit as cash
    /// collected and a sale. The undo snapshot exists before any financial row.
    pub async fn resolve_deposit(
        &self,
        appointment_id: i64,
        target_key: &str,
        amount: f64,
    ) -> Result<Appointment, WorkflowError> {
        let appointment = self.load(appointment_id).await?;
        if !(amount.is_finite() && amount > 0.0) {
            return Err(self.precondition(
                appointment.team_id,
                WorkflowError::InvalidInput("Deposit amount must be greater than zero".into()),
            ));
        }
        let stage = self
            .resolve_dialog_stage(&appointment, target_key, &[StageKind::Deposit])
            .await?;

        let team_id = appointment.team_id;
        self.commit(&appointment, &stage).await?;
        let updated = self
            .guard_write(
                team_id,
                "record deposit",
                self.store.set_revenue(
                    appointment.id,
                    amount,
                    appointment.mrr_amount,
                    appointment.mrr_months,
                ),
            )
            .await?;
        self.guard_write(
            team_id,
            "record deposit sale",
            self.store.record_sale(
                team_id,
                appointment.id,
                &appointment.lead_email,
                appointment.closer.as_deref(),
                amount,
            ),
        )
        .await?;
        self.notifier.appointment_changed(&updated);
        Ok(updated)
    }

    /// Capture revenue for a won deal: one sale row plus one commission row
    /// per recurring month.
    pub async fn close_deal(
        &self,
        appointment_id: i64,
        cash_collected: f64,
        mrr_amount: f64,
        mrr_months: i32,
    ) -> Result<CloseDealResult, WorkflowError> {
        let appointment = self.load(appointment_id).await?;
        let team_id = appointment.team_id;
        let valid = cash_collected.is_finite()
            && cash_collected >= 0.0
            && mrr_amount.is_finite()
            && mrr_amount >= 0.0
            && (0..=120).contains(&mrr_months);
        if !valid {
            return Err(self.precondition(
                team_id,
                WorkflowError::InvalidInput(
                    "Revenue must be non-negative and recurring months between 0 and 120".into(),
                ),
            ));
        }
        let stages = self.stages(team_id).await?;
        let in_won_stage = stages.iter().any(|s| {
            s.kind == StageKind::Won && appointment.pipeline_stage.as_deref() == Some(s.stage_key.as_str())
        });
        if !in_won_stage {
            return Err(self.precondition(
                team_id,
                WorkflowError::InvalidInput(format!(
                    "Appointment {} is not in a won stage",
                    appointment.id
                )),
            ));
        }

        let updated = self
            .guard_write(
                team_id,
                "save deal revenue",
                self.store
                    .set_revenue(appointment.id, cash_collected, mrr_amount, mrr_months),
            )
            .await?;
        let sale = self
            .guard_write(
                team_id,
                "record sale",
                self.store.record_sale(
                    team_id,
                    appointment.id,
                    &appointment.lead_email,
                    appointment.closer.as_deref(),
                    cash_collected,
                ),
            )
            .await?;

        let mut commissions = Vec::new();
        if mrr_amount > 0.0 {
            for month in 1..=mrr_months {
                let commission = self
                    .guard_write(
                        team_id,
                        "record recurring commission",
                        self.store.record_mrr_commission(&sale, month, mrr_amount),
                    )
                    .await?;
                commissions.push(commission);
            }
        }

        let note = format!(
            "cash {:.2}, mrr {:.2} x {} months",
            cash_collected, mrr_amount, mrr_months
        );
        self.guard_write(
            team_id,
            "log closed deal",
            self.store
                .log_activity(team_id, appointment.id, "deal_closed", &note),
        )
        .await?;

        info!(
            appointment_id,
            team_id,
            cash_collected,
            commissions = commissions.len(),
            "Deal closed"
        );
        self.notifier.appointment_changed(&updated);
        Ok(CloseDealResult {
            appointment: updated,
            sale,
            commissions,
        })
    }

    /// Log an unanswered confirmation call on a task.
    pub async fn record_no_answer(
        &self,
        task_id: i64,
        note: &str,
        retry_at: Option<&str>,
    ) -> Result<ConfirmationTask, WorkflowError> {
        let task = self
            .store
            .get_task(task_id)
            .await
            .map_err(|source| WorkflowError::Remote {
                action: "load task".into(),
                source,
            })?
            .ok_or(WorkflowError::TaskNotFound { id: task_id })?;

        self.guard_write(
            task.team_id,
            "record no-answer",
            self.store.record_no_answer(task_id, note, retry_at),
        )
        .await
    }

    /// Two bookings for the same lead: cancel `discard_id`, keep `keep_id`.
    pub async fn resolve_double_book(
        &self,
        keep_id: i64,
        discard_id: i64,
    ) -> Result<DoubleBookResolution, WorkflowError> {
        let kept = self.load(keep_id).await?;
        let discard = self.load(discard_id).await?;
        let team_id = discard.team_id;

        let problem = if keep_id == discard_id {
            Some("Cannot resolve an appointment against itself")
        } else if kept.team_id != discard.team_id {
            Some("Appointments belong to different teams")
        } else if !kept.lead_email.eq_ignore_ascii_case(&discard.lead_email) {
            Some("Appointments are for different leads")
        } else {
            None
        };
        if let Some(problem) = problem {
            return Err(self.precondition(team_id, WorkflowError::InvalidInput(problem.into())));
        }

        let stages = self.stages(team_id).await?;
        let cancelled_stage = stages.iter().find(|s| s.kind == StageKind::Cancelled);

        let cancelled = match cancelled_stage {
            Some(stage) => {
                self.guard_write(
                    team_id,
                    "cancel duplicate booking",
                    self.store.move_appointment(
                        discard.id,
                        &stage.stage_key,
                        Some(AppointmentStatus::Cancelled),
                    ),
                )
                .await?
            }
            None => {
                let mut fields = discard.stage_fields();
                fields.status = AppointmentStatus::Cancelled;
                self.guard_write(
                    team_id,
                    "cancel duplicate booking",
                    self.store.restore_fields(discard.id, &fields),
                )
                .await?
            }
        };

        self.guard_write(
            team_id,
            "clean up duplicate booking tasks",
            self.store
                .cleanup_confirmation_tasks(discard.id, "double booked"),
        )
        .await?;
        self.guard_write(
            team_id,
            "log double booking",
            self.store.log_activity(
                team_id,
                discard.id,
                "double_book_resolved",
                &format!("kept appointment {}", kept.id),
            ),
        )
        .await?;

        info!(team_id, keep_id, discard_id, "Double booking resolved");
        self.notifier.appointment_changed(&cancelled);
        Ok(DoubleBookResolution { kept, cancelled })
    }

    /// Revert the team's last committed move.
    ///
    /// Moves into a stage that wrote sale/commission rows need `confirmed`;
    /// the rows are deleted (commissions first, then sales) before the
    /// appointment fields are restored.
    pub async fn undo(&self, team_id: i64, confirmed: bool) -> Result<UndoOutcome, WorkflowError> {
        let Some(snapshot) = self.undo.peek(team_id) else {
            return Ok(UndoOutcome::NothingToUndo);
        };

        let mut commissions_deleted = 0;
        let mut sales_deleted = 0;
        if snapshot.moved_to.carries_financials() {
            if !confirmed {
                return Ok(UndoOutcome::ConfirmationRequired { snapshot });
            }
            commissions_deleted = self
                .guard_write(
                    team_id,
                    "delete commissions",
                    self.store
                        .delete_mrr_commissions_for_lead(team_id, &snapshot.lead_email),
                )
                .await?;
            sales_deleted = self
                .guard_write(
                    team_id,
                    "delete sales",
                    self.store
                        .delete_sales_for_lead(team_id, &snapshot.lead_email),
                )
                .await?;
        }

        let appointment = self
            .guard_write(
                team_id,
                "undo move",
                self.store
                    .restore_fields(snapshot.appointment_id, &snapshot.previous),
            )
            .await?;
        self.undo.take(team_id);

        info!(
            team_id,
            appointment_id = snapshot.appointment_id,
            from = %snapshot.moved_to_stage,
            commissions_deleted,
            sales_deleted,
            "Move undone"
        );
        self.notifier.appointment_changed(&appointment);
        Ok(UndoOutcome::Restored {
            appointment,
            commissions_deleted,
            sales_deleted,
        })
    }

    // ── Internals ─────────────────────────────────────────────────────

    /// Store the move, log it, and clear confirmation tasks on terminal stages.
    async fn commit(
        &self,
        appointment: &Appointment,
        stage: &PipelineStage,
    ) -> Result<Appointment, WorkflowError> {
        let team_id = appointment.team_id;
        let previous = appointment.stage_fields();

        let updated = self
            .guard_write(
                team_id,
                "move appointment",
                self.store.move_appointment(
                    appointment.id,
                    &stage.stage_key,
                    stage.kind.implied_status(),
                ),
            )
            .await?;
        self.undo.record(StageSnapshot {
            appointment_id: appointment.id,
            team_id,
            lead_email: appointment.lead_email.clone(),
            previous,
            moved_to_stage: stage.stage_key.clone(),
            moved_to: stage.kind,
        });

        let from = appointment.pipeline_stage.as_deref().unwrap_or("none");
        self.guard_write(
            team_id,
            "log stage change",
            self.store.log_activity(
                team_id,
                appointment.id,
                "stage_changed",
                &format!("{} -> {}", from, stage.stage_key),
            ),
        )
        .await?;

        if stage.kind.is_terminal() {
            let reason = format!("moved to {}", stage.stage_key);
            self.guard_write(
                team_id,
                "clean up confirmation tasks",
                self.store.cleanup_confirmation_tasks(appointment.id, &reason),
            )
            .await?;
        }

        info!(
            appointment_id = appointment.id,
            team_id,
            from,
            to = %stage.stage_key,
            kind = stage.kind.as_str(),
            "Stage committed"
        );
        self.notifier.appointment_changed(&updated);
        Ok(updated)
    }

    async fn reschedule_url(&self, appointment: &Appointment) -> Result<String, WorkflowError> {
        if let Some(url) = appointment.reschedule_url.as_deref()
            && !url.is_empty()
        {
            return Ok(url.to_string());
        }

        let Some(invitee_ref) = appointment.calendar_invitee_ref.as_deref() else {
            return Err(self.precondition(
                appointment.team_id,
                WorkflowError::MissingRescheduleReference {
                    appointment_id: appointment.id,
                },
            ));
        };

        let url = match self.calendar.fetch_reschedule_url(invitee_ref).await {
            Ok(url) => url,
            Err(e) => {
                return Err(self.precondition(appointment.team_id, WorkflowError::Calendar(e)));
            }
        };
        self.guard_write(
            appointment.team_id,
            "cache reschedule link",
            self.store.cache_reschedule_url(appointment.id, &url),
        )
        .await?;
        Ok(url)
    }

    async fn stages(&self, team_id: i64) -> Result<Vec<PipelineStage>, WorkflowError> {
        self.store
            .list_stages(team_id)
            .await
            .map_err(|source| WorkflowError::Remote {
                action: "load stages".into(),
                source,
            })
    }

    async fn resolve_stage(
        &self,
        team_id: i64,
        stage_key: &str,
    ) -> Result<PipelineStage, WorkflowError> {
        let stages = self.stages(team_id).await?;
        match stages.into_iter().find(|s| s.stage_key == stage_key) {
            Some(stage) => Ok(stage),
            None => Err(self.precondition(
                team_id,
                WorkflowError::StageNotFound {
                    team_id,
                    stage_key: stage_key.to_string(),
                },
            )),
        }
    }

    async fn resolve_dialog_stage(
        &self,
        appointment: &Appointment,
        stage_key: &str,
        expected: &[StageKind],
    ) -> Result<PipelineStage, WorkflowError> {
        let stage = self.resolve_stage(appointment.team_id, stage_key).await?;
        if !expected.contains(&stage.kind) {
            return Err(self.precondition(
                appointment.team_id,
                WorkflowError::InvalidInput(format!(
                    "Stage '{}' is a {} stage, which this dialog cannot complete",
                    stage.stage_key,
                    stage.kind.as_str()
                )),
            ));
        }
        Ok(stage)
    }

    /// Run a store write; on failure emit one error toast and one reload
    /// request for the team.
    async fn guard_write<T, F>(
        &self,
        team_id: i64,
        action: &str,
        write: F,
    ) -> Result<T, WorkflowError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match write.await {
            Ok(value) => Ok(value),
            Err(source) => {
                error!(team_id, action, error = %source, "Store write failed");
                self.notifier
                    .toast(team_id, ToastLevel::Error, &format!("Failed to {}", action));
                self.notifier.request_reload(team_id);
                Err(WorkflowError::Remote {
                    action: action.to_string(),
                    source,
                })
            }
        }
    }

    /// Report a failed precondition: one blocking toast, no reload.
    fn precondition(&self, team_id: i64, err: WorkflowError) -> WorkflowError {
        warn!(team_id, error = %err, "Stage transition blocked");
        self.notifier
            .toast(team_id, ToastLevel::Error, &err.to_string());
        err
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
