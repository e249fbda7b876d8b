use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    New,
    Confirmed,
    Showed,
    NoShow,
    Cancelled,
    Rescheduled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Confirmed => "CONFIRMED",
            Self::Showed => "SHOWED",
            Self::NoShow => "NO_SHOW",
            Self::Cancelled => "CANCELLED",
            Self::Rescheduled => "RESCHEDULED",
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "CONFIRMED" => Ok(Self::Confirmed),
            "SHOWED" => Ok(Self::Showed),
            "NO_SHOW" => Ok(Self::NoShow),
            "CANCELLED" => Ok(Self::Cancelled),
            "RESCHEDULED" => Ok(Self::Rescheduled),
            _ => Err(format!("Invalid appointment status: {}", s)),
        }
    }
}

/// What a pipeline stage means to the transition workflow.
///
/// Assigned when a stage is configured. Labels are for display only; the
/// workflow dispatches on this tag alone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Booked,
    Won,
    Lost,
    NoShow,
    Cancelled,
    Rescheduled,
    Deposit,
    Disqualified,
    Custom,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Booked => "booked",
            Self::Won => "won",
            Self::Lost => "lost",
            Self::NoShow => "no_show",
            Self::Cancelled => "cancelled",
            Self::Rescheduled => "rescheduled",
            Self::Deposit => "deposit",
            Self::Disqualified => "disqualified",
            Self::Custom => "custom",
        }
    }

    /// Terminal stages clear any outstanding confirmation work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Won
                | Self::Lost
                | Self::NoShow
                | Self::Cancelled
                | Self::Rescheduled
                | Self::Disqualified
        )
    }

    /// Stages whose entry writes sale/commission rows that a snapshot
    /// restore cannot reverse on its own.
    pub fn carries_financials(&self) -> bool {
        matches!(self, Self::Won | Self::Deposit)
    }

    /// Appointment status implied by entering a stage of this kind.
    pub fn implied_status(&self) -> Option<AppointmentStatus> {
        match self {
            Self::NoShow => Some(AppointmentStatus::NoShow),
            Self::Cancelled => Some(AppointmentStatus::Cancelled),
            Self::Rescheduled => Some(AppointmentStatus::Rescheduled),
            _ => None,
        }
    }

    /// Best-effort kind for a stage configured without an explicit one.
    ///
    /// Runs once when the stage is created; the result is persisted and can
    /// be corrected by an admin afterwards.
    pub fn infer(stage_key: &str, label: &str) -> Self {
        let key = stage_key.trim().to_lowercase();
        let label = label.trim().to_lowercase();
        let has = |needle: &str| key.contains(needle) || label.contains(needle);

        if has("reschedul") {
            Self::Rescheduled
        } else if key == "no_show" || has("no show") || has("no-show") || has("noshow") {
            Self::NoShow
        } else if has("cancel") {
            Self::Cancelled
        } else if has("deposit") {
            Self::Deposit
        } else if has("disqualif") {
            Self::Disqualified
        } else if has("lost") {
            Self::Lost
        } else if has("won") || has("closed") {
            Self::Won
        } else if key == "new" || has("booked") {
            Self::Booked
        } else {
            Self::Custom
        }
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "booked" => Ok(Self::Booked),
            "won" => Ok(Self::Won),
            "lost" => Ok(Self::Lost),
            "no_show" => Ok(Self::NoShow),
            "cancelled" => Ok(Self::Cancelled),
            "rescheduled" => Ok(Self::Rescheduled),
            "deposit" => Ok(Self::Deposit),
            "disqualified" => Ok(Self::Disqualified),
            "custom" => Ok(Self::Custom),
            _ => Err(format!("Invalid stage kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStage {
    pub id: i64,
    pub team_id: i64,
    pub stage_key: String,
    pub label: String,
    pub color: String,
    pub position: i32,
    pub kind: StageKind,
}

/// The stage set a new team starts with.
pub fn default_stages() -> Vec<(&'static str, &'static str, &'static str, StageKind)> {
    vec![
        ("booked", "Appointments Booked", "#64748b", StageKind::Booked),
        ("no_show", "No Show", "#f97316", StageKind::NoShow),
        ("canceled", "Canceled", "#ef4444", StageKind::Cancelled),
        ("rescheduled", "Rescheduled", "#eab308", StageKind::Rescheduled),
        ("follow_up", "Follow Up", "#3b82f6", StageKind::Custom),
        ("deposit", "Deposit Collected", "#8b5cf6", StageKind::Deposit),
        ("won", "Closed Won", "#22c55e", StageKind::Won),
        ("lost", "Closed Lost", "#6b7280", StageKind::Lost),
        ("disqualified", "Disqualified", "#111827", StageKind::Disqualified),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: i64,
    pub team_id: i64,
    pub lead_name: String,
    pub lead_email: String,
    pub start_time: String,
    pub setter: Option<String>,
    pub closer: Option<String>,
    pub cash_collected: f64,
    pub mrr_amount: f64,
    pub mrr_months: i32,
    pub status: AppointmentStatus,
    pub pipeline_stage: Option<String>,
    pub original_appointment_id: Option<i64>,
    pub rescheduled_to_id: Option<i64>,
    pub reschedule_url: Option<String>,
    pub reschedule_count: i32,
    pub calendar_invitee_ref: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Appointment {
    /// Fields a stage commit may change, captured for undo.
    pub fn stage_fields(&self) -> StageFields {
        StageFields {
            pipeline_stage: self.pipeline_stage.clone(),
            status: self.status,
            cash_collected: self.cash_collected,
            mrr_amount: self.mrr_amount,
            mrr_months: self.mrr_months,
            reschedule_count: self.reschedule_count,
        }
    }

    pub fn projected_mrr(&self) -> f64 {
        self.mrr_amount * f64::from(self.mrr_months.max(0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageFields {
    pub pipeline_stage: Option<String>,
    pub status: AppointmentStatus,
    pub cash_collected: f64,
    pub mrr_amount: f64,
    pub mrr_months: i32,
    #[serde(default)]
    pub reschedule_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAppointment {
    pub team_id: i64,
    pub lead_name: String,
    pub lead_email: String,
    pub start_time: String,
    #[serde(default)]
    pub setter: Option<String>,
    #[serde(default)]
    pub closer: Option<String>,
    #[serde(default)]
    pub pipeline_stage: Option<String>,
    #[serde(default)]
    pub calendar_invitee_ref: Option<String>,
    #[serde(default)]
    pub original_appointment_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Confirm,
    FollowUp,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::FollowUp => "follow_up",
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirm" => Ok(Self::Confirm),
            "follow_up" => Ok(Self::FollowUp),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationTask {
    pub id: i64,
    pub appointment_id: i64,
    pub team_id: i64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub due_at: Option<String>,
    pub attempts: i32,
    pub notes: String,
    pub cancel_reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub appointment_id: i64,
    pub task_type: TaskType,
    pub assigned_to: Option<String>,
    pub due_at: Option<String>,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLog {
    pub id: i64,
    pub team_id: i64,
    pub appointment_id: i64,
    pub action: String,
    pub note: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sale {
    pub id: i64,
    pub team_id: i64,
    pub appointment_id: i64,
    pub lead_email: String,
    pub closer: Option<String>,
    pub amount: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrrCommission {
    pub id: i64,
    pub team_id: i64,
    pub sale_id: i64,
    pub lead_email: String,
    pub closer: Option<String>,
    pub month_number: i32,
    pub amount: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            AppointmentStatus::New,
            AppointmentStatus::Confirmed,
            AppointmentStatus::Showed,
            AppointmentStatus::NoShow,
            AppointmentStatus::Cancelled,
            AppointmentStatus::Rescheduled,
        ] {
            assert_eq!(AppointmentStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(AppointmentStatus::from_str("no_show").is_err());
    }

    #[test]
    fn test_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&AppointmentStatus::NoShow).unwrap();
        assert_eq!(json, "\"NO_SHOW\"");
    }

    #[test]
    fn test_infer_kind_from_common_labels() {
        assert_eq!(StageKind::infer("won", "Closed Won"), StageKind::Won);
        assert_eq!(StageKind::infer("closed", "Closed"), StageKind::Won);
        assert_eq!(StageKind::infer("closed_lost", "Closed Lost"), StageKind::Lost);
        assert_eq!(StageKind::infer("canceled", "Canceled"), StageKind::Cancelled);
        assert_eq!(StageKind::infer("no_show", "No Show"), StageKind::NoShow);
        assert_eq!(StageKind::infer("rescheduled", "Rescheduled"), StageKind::Rescheduled);
        assert_eq!(StageKind::infer("stage_7", "Deposit Collected"), StageKind::Deposit);
        assert_eq!(StageKind::infer("dq", "Disqualified"), StageKind::Disqualified);
        assert_eq!(StageKind::infer("new", "New"), StageKind::Booked);
        assert_eq!(StageKind::infer("proposal", "Proposal Sent"), StageKind::Custom);
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(StageKind::Won.is_terminal());
        assert!(StageKind::Disqualified.is_terminal());
        assert!(StageKind::Rescheduled.is_terminal());
        assert!(!StageKind::Deposit.is_terminal());
        assert!(!StageKind::Booked.is_terminal());
        assert!(!StageKind::Custom.is_terminal());
    }

    #[test]
    fn test_financial_kinds() {
        assert!(StageKind::Won.carries_financials());
        assert!(StageKind::Deposit.carries_financials());
        assert!(!StageKind::Lost.carries_financials());
    }

    #[test]
    fn test_implied_status() {
        assert_eq!(StageKind::NoShow.implied_status(), Some(AppointmentStatus::NoShow));
        assert_eq!(StageKind::Won.implied_status(), None);
    }

    #[test]
    fn test_default_stages_cover_every_dialog_kind() {
        let kinds: Vec<StageKind> = default_stages().into_iter().map(|s| s.3).collect();
        for kind in [
            StageKind::Booked,
            StageKind::Won,
            StageKind::NoShow,
            StageKind::Cancelled,
            StageKind::Rescheduled,
            StageKind::Deposit,
        ] {
            assert!(kinds.contains(&kind), "missing {:?}", kind);
        }
    }
}
