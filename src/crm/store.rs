use anyhow::Result;
use async_trait::async_trait;

use super::models::*;
use crate::db::DbHandle;

/// Row-level access the stage workflow needs from the CRM store.
///
/// `DbHandle` is the production implementation; the workflow tests swap in a
/// recording double so they can assert exactly which writes a move performs.
#[async_trait]
pub trait CrmStore: Send + Sync {
    async fn get_appointment(&self, id: i64) -> Result<Option<Appointment>>;

    async fn list_stages(&self, team_id: i64) -> Result<Vec<PipelineStage>>;

    async fn get_task(&self, id: i64) -> Result<Option<ConfirmationTask>>;

    async fn move_appointment(
        &self,
        id: i64,
        stage_key: &str,
        status: Option<AppointmentStatus>,
    ) -> Result<Appointment>;

    async fn restore_fields(&self, id: i64, fields: &StageFields) -> Result<Appointment>;

    async fn cache_reschedule_url(&self, id: i64, url: &str) -> Result<()>;

    async fn increment_reschedule_count(&self, id: i64) -> Result<Appointment>;

    async fn set_revenue(
        &self,
        id: i64,
        cash_collected: f64,
        mrr_amount: f64,
        mrr_months: i32,
    ) -> Result<Appointment>;

    async fn log_activity(
        &self,
        team_id: i64,
        appointment_id: i64,
        action: &str,
        note: &str,
    ) -> Result<()>;

    /// Cancel pending confirmation tasks; returns how many were cancelled.
    async fn cleanup_confirmation_tasks(&self, appointment_id: i64, reason: &str) -> Result<usize>;

    async fn create_task_with_assignment(&self, task: &NewTask) -> Result<ConfirmationTask>;

    async fn record_no_answer(
        &self,
        task_id: i64,
        note: &str,
        retry_at: Option<&str>,
    ) -> Result<ConfirmationTask>;

    async fn record_sale(
        &self,
        team_id: i64,
        appointment_id: i64,
        lead_email: &str,
        closer: Option<&str>,
        amount: f64,
    ) -> Result<Sale>;

    async fn record_mrr_commission(
        &self,
        sale: &Sale,
        month_number: i32,
        amount: f64,
    ) -> Result<MrrCommission>;

    async fn delete_mrr_commissions_for_lead(&self, team_id: i64, lead_email: &str)
    -> Result<usize>;

    async fn delete_sales_for_lead(&self, team_id: i64, lead_email: &str) -> Result<usize>;
}

#[async_trait]
impl CrmStore for DbHandle {
    async fn get_appointment(&self, id: i64) -> Result<Option<Appointment>> {
        self.call(move |db| db.get_appointment(id)).await
    }

    async fn list_stages(&self, team_id: i64) -> Result<Vec<PipelineStage>> {
        self.call(move |db| db.list_stages(team_id)).await
    }

    async fn get_task(&self, id: i64) -> Result<Option<ConfirmationTask>> {
        self.call(move |db| db.get_task(id)).await
    }

    async fn move_appointment(
        &self,
        id: i64,
        stage_key: &str,
        status: Option<AppointmentStatus>,
    ) -> Result<Appointment> {
        let stage_key = stage_key.to_string();
        self.call(move |db| db.update_appointment_stage(id, &stage_key, status))
            .await
    }

    async fn restore_fields(&self, id: i64, fields: &StageFields) -> Result<Appointment> {
        let fields = fields.clone();
        self.call(move |db| db.restore_stage_fields(id, &fields)).await
    }

    async fn cache_reschedule_url(&self, id: i64, url: &str) -> Result<()> {
        let url = url.to_string();
        self.call(move |db| db.set_reschedule_url(id, &url)).await
    }

    async fn increment_reschedule_count(&self, id: i64) -> Result<Appointment> {
        self.call(move |db| db.increment_reschedule_count(id)).await
    }

    async fn set_revenue(
        &self,
        id: i64,
        cash_collected: f64,
        mrr_amount: f64,
        mrr_months: i32,
    ) -> Result<Appointment> {
        self.call(move |db| db.set_revenue(id, cash_collected, mrr_amount, mrr_months))
            .await
    }

    async fn log_activity(
        &self,
        team_id: i64,
        appointment_id: i64,
        action: &str,
        note: &str,
    ) -> Result<()> {
        let (action, note) = (action.to_string(), note.to_string());
        self.call(move |db| {
            db.log_activity(team_id, appointment_id, &action, &note)?;
            Ok(())
        })
        .await
    }

    async fn cleanup_confirmation_tasks(&self, appointment_id: i64, reason: &str) -> Result<usize> {
        let reason = reason.to_string();
        self.call(move |db| db.cleanup_confirmation_tasks(appointment_id, &reason))
            .await
    }

    async fn create_task_with_assignment(&self, task: &NewTask) -> Result<ConfirmationTask> {
        let task = task.clone();
        self.call(move |db| db.create_task_with_assignment(&task)).await
    }

    async fn record_no_answer(
        &self,
        task_id: i64,
        note: &str,
        retry_at: Option<&str>,
    ) -> Result<ConfirmationTask> {
        let note = note.to_string();
        let retry_at = retry_at.map(str::to_string);
        self.call(move |db| db.record_no_answer(task_id, &note, retry_at.as_deref()))
            .await
    }

    async fn record_sale(
        &self,
        team_id: i64,
        appointment_id: i64,
        lead_email: &str,
        closer: Option<&str>,
        amount: f64,
    ) -> Result<Sale> {
        let lead_email = lead_email.to_string();
        let closer = closer.map(str::to_string);
        self.call(move |db| {
            db.insert_sale(team_id, appointment_id, &lead_email, closer.as_deref(), amount)
        })
        .await
    }

    async fn record_mrr_commission(
        &self,
        sale: &Sale,
        month_number: i32,
        amount: f64,
    ) -> Result<MrrCommission> {
        let sale = sale.clone();
        self.call(move |db| {
            db.insert_mrr_commission(
                sale.team_id,
                sale.id,
                &sale.lead_email,
                sale.closer.as_deref(),
                month_number,
                amount,
            )
        })
        .await
    }

    async fn delete_mrr_commissions_for_lead(
        &self,
        team_id: i64,
        lead_email: &str,
    ) -> Result<usize> {
        let lead_email = lead_email.to_string();
        self.call(move |db| db.delete_mrr_commissions_for_lead(team_id, &lead_email))
            .await
    }

    async fn delete_sales_for_lead(&self, team_id: i64, lead_email: &str) -> Result<usize> {
        let lead_email = lead_email.to_string();
        self.call(move |db| db.delete_sales_for_lead(team_id, &lead_email))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn handle() -> DbHandle {
        DbHandle::new(Database::new_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_db_handle_moves_through_trait() {
        let store = handle();
        let appt = store
            .call(|db| {
                db.seed_default_stages(1)?;
                db.create_appointment(&NewAppointment {
                    team_id: 1,
                    lead_name: "Lee".into(),
                    lead_email: "lee@example.com".into(),
                    start_time: "2026-05-01T09:00:00Z".into(),
                    setter: None,
                    closer: Some("cara".into()),
                    pipeline_stage: Some("booked".into()),
                    calendar_invitee_ref: None,
                    original_appointment_id: None,
                })
            })
            .await
            .unwrap();

        let store: &dyn CrmStore = &store;
        let moved = store
            .move_appointment(appt.id, "canceled", Some(AppointmentStatus::Cancelled))
            .await
            .unwrap();
        assert_eq!(moved.pipeline_stage.as_deref(), Some("canceled"));
        assert_eq!(moved.status, AppointmentStatus::Cancelled);

        let restored = store.restore_fields(appt.id, &appt.stage_fields()).await.unwrap();
        assert_eq!(restored.pipeline_stage.as_deref(), Some("booked"));
        assert_eq!(restored.status, AppointmentStatus::New);
    }

    #[tokio::test]
    async fn test_db_handle_sale_and_commission_cleanup() {
        let handle = handle();
        let store: &dyn CrmStore = &handle;
        let sale = store
            .record_sale(1, 10, "lee@example.com", Some("cara"), 900.0)
            .await
            .unwrap();
        for month in 1..=3 {
            store.record_mrr_commission(&sale, month, 150.0).await.unwrap();
        }

        assert_eq!(
            store
                .delete_mrr_commissions_for_lead(1, "lee@example.com")
                .await
                .unwrap(),
            3
        );
        assert_eq!(store.delete_sales_for_lead(1, "lee@example.com").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_db_handle_missing_appointment_is_none() {
        let handle = handle();
        let store: &dyn CrmStore = &handle;
        assert!(store.get_appointment(404).await.unwrap().is_none());
        assert!(store.move_appointment(404, "won", None).await.is_err());
    }
}
