//! Typed error hierarchy for dealflow.
//!
//! Three top-level enums cover the three subsystems:
//! - `WorkflowError`: pipeline stage transitions and their dialogs
//! - `BuilderError`: funnel page tree edits
//! - `CopilotParseError`: AI copilot responses that could not be applied

use thiserror::Error;

/// Errors from the pipeline stage-transition workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Appointment {id} not found")]
    AppointmentNotFound { id: i64 },

    #[error("Confirmation task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Stage '{stage_key}' is not configured for team {team_id}")]
    StageNotFound { team_id: i64, stage_key: String },

    #[error(
        "No reschedule link is available for appointment {appointment_id}. \
         Re-import the appointment from the calendar to restore its invitee reference."
    )]
    MissingRescheduleReference { appointment_id: i64 },

    #[error("Calendar service error: {0}")]
    Calendar(#[source] anyhow::Error),

    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Failed to {action}: {source}")]
    Remote {
        action: String,
        #[source]
        source: anyhow::Error,
    },
}

impl WorkflowError {
    /// True for errors raised before any write was attempted.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::AppointmentNotFound { .. }
                | Self::TaskNotFound { .. }
                | Self::StageNotFound { .. }
                | Self::MissingRescheduleReference { .. }
                | Self::InvalidInput(_)
        )
    }
}

/// Errors from funnel page tree edits.
#[derive(Debug, Error, PartialEq)]
pub enum BuilderError {
    #[error("Step {0} not found")]
    StepNotFound(String),

    #[error("Stack {0} not found")]
    StackNotFound(String),

    #[error("Block {0} not found")]
    BlockNotFound(String),

    #[error("Element {0} not found")]
    ElementNotFound(String),

    #[error("Funnel has no steps to place content into")]
    EmptyFunnel,
}

/// Errors from parsing an AI copilot response.
#[derive(Debug, Error)]
pub enum CopilotParseError {
    #[error("Response was empty")]
    Empty,

    #[error("Response did not contain a JSON object")]
    NoJson,

    #[error("Response JSON did not match the expected {expected} shape: {source}")]
    Shape {
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Response was structurally empty: {0}")]
    Incomplete(String),
}
