//! Board and closer projections over a team's appointments.
//!
//! Both projections are pure. `board_columns` places every appointment in
//! exactly one column; `closer_view` places each of a closer's appointments
//! once, except rescheduled ones, which also appear (tagged) in the booked
//! bucket.

use serde::Serialize;

use super::models::*;

/// Key and label of the bucket for appointments that have not progressed.
pub const BOOKED_BUCKET_KEY: &str = "appointments_booked";
pub const BOOKED_BUCKET_LABEL: &str = "Appointments Booked";

#[derive(Debug, Clone, Serialize)]
pub struct BoardColumn {
    pub stage_key: String,
    pub label: String,
    pub color: String,
    pub kind: StageKind,
    pub appointments: Vec<Appointment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloserCard {
    pub appointment: Appointment,
    /// Set on the booked-bucket copy of a rescheduled appointment.
    pub rescheduled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloserBucket {
    pub stage_key: String,
    pub label: String,
    pub kind: StageKind,
    pub cards: Vec<CloserCard>,
    pub count: usize,
    pub cash_collected: f64,
    pub mrr: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CloserTotals {
    pub appointments: usize,
    pub closed_deals: usize,
    pub cash_collected: f64,
    pub mrr: f64,
    pub close_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloserView {
    pub closer: String,
    pub buckets: Vec<CloserBucket>,
    pub rescheduled_duplicates: usize,
    pub totals: CloserTotals,
}

fn ordered(stages: &[PipelineStage]) -> Vec<&PipelineStage> {
    let mut ordered: Vec<&PipelineStage> = stages.iter().collect();
    ordered.sort_by_key(|s| (s.position, s.id));
    ordered
}

/// One column per configured stage in position order.
///
/// Appointments with no stage, or a stage key the team no longer has, land
/// in the first `Booked` column, or in a synthetic booked column placed first
/// when the team has none.
pub fn board_columns(stages: &[PipelineStage], appointments: &[Appointment]) -> Vec<BoardColumn> {
    let mut columns: Vec<BoardColumn> = ordered(stages)
        .into_iter()
        .map(|s| BoardColumn {
            stage_key: s.stage_key.clone(),
            label: s.label.clone(),
            color: s.color.clone(),
            kind: s.kind,
            appointments: Vec::new(),
        })
        .collect();

    let fallback = match columns.iter().position(|c| c.kind == StageKind::Booked) {
        Some(idx) => idx,
        None => {
            columns.insert(
                0,
                BoardColumn {
                    stage_key: BOOKED_BUCKET_KEY.to_string(),
                    label: BOOKED_BUCKET_LABEL.to_string(),
                    color: "#64748b".to_string(),
                    kind: StageKind::Booked,
                    appointments: Vec::new(),
                },
            );
            0
        }
    };

    for appt in appointments {
        let idx = appt
            .pipeline_stage
            .as_deref()
            .and_then(|key| columns.iter().position(|c| c.stage_key == key))
            .unwrap_or(fallback);
        columns[idx].appointments.push(appt.clone());
    }
    columns
}

/// Re-project the board for one closer with per-bucket and overall figures.
pub fn closer_view(
    stages: &[PipelineStage],
    appointments: &[Appointment],
    closer: &str,
) -> CloserView {
    let stages = ordered(stages);
    let closer = closer.trim();

    let mut booked = CloserBucket::new(BOOKED_BUCKET_KEY, BOOKED_BUCKET_LABEL, StageKind::Booked);
    let mut buckets: Vec<CloserBucket> = stages
        .iter()
        .filter(|s| s.kind != StageKind::Booked)
        .map(|s| CloserBucket::new(&s.stage_key, &s.label, s.kind))
        .collect();
    let rescheduled_idx = buckets.iter().position(|b| b.kind == StageKind::Rescheduled);

    let mine: Vec<&Appointment> = appointments
        .iter()
        .filter(|a| {
            a.closer
                .as_deref()
                .is_some_and(|c| c.trim().eq_ignore_ascii_case(closer))
        })
        .collect();

    let mut rescheduled_duplicates = 0;
    let mut closed_deals = 0;
    for appt in &mine {
        let stage = appt
            .pipeline_stage
            .as_deref()
            .and_then(|key| stages.iter().find(|s| s.stage_key == key));
        let kind = stage.map(|s| s.kind);
        if kind == Some(StageKind::Won) {
            closed_deals += 1;
        }

        let is_rescheduled =
            kind == Some(StageKind::Rescheduled) || appt.status == AppointmentStatus::Rescheduled;
        let is_booked =
            kind.is_none() || kind == Some(StageKind::Booked) || appt.status == AppointmentStatus::New;

        if is_rescheduled {
            booked.push(appt, true);
            if let Some(idx) = rescheduled_idx {
                buckets[idx].push(appt, false);
                rescheduled_duplicates += 1;
            }
        } else if is_booked {
            booked.push(appt, false);
        } else if let Some(stage) = stage
            && let Some(bucket) = buckets.iter_mut().find(|b| b.stage_key == stage.stage_key)
        {
            bucket.push(appt, false);
        } else {
            booked.push(appt, false);
        }
    }

    let cash_collected: f64 = mine.iter().map(|a| a.cash_collected).sum();
    let mrr: f64 = mine.iter().map(|a| a.projected_mrr()).sum();
    let close_rate = if mine.is_empty() {
        0.0
    } else {
        closed_deals as f64 / mine.len() as f64
    };

    let mut all = Vec::with_capacity(buckets.len() + 1);
    all.push(booked);
    all.extend(buckets);

    CloserView {
        closer: closer.to_string(),
        buckets: all,
        rescheduled_duplicates,
        totals: CloserTotals {
            appointments: mine.len(),
            closed_deals,
            cash_collected,
            mrr,
            close_rate,
        },
    }
}

impl CloserBucket {
    fn new(stage_key: &str, label: &str, kind: StageKind) -> Self {
        Self {
            stage_key: stage_key.to_string(),
            label: label.to_string(),
            kind,
            cards: Vec::new(),
            count: 0,
            cash_collected: 0.0,
            mrr: 0.0,
        }
    }

    fn push(&mut self, appointment: &Appointment, rescheduled: bool) {
        self.count += 1;
        self.cash_collected += appointment.cash_collected;
        self.mrr += appointment.projected_mrr();
        self.cards.push(CloserCard {
            appointment: appointment.clone(),
            rescheduled,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stages() -> Vec<PipelineStage> {
        default_stages()
            .into_iter()
            .enumerate()
            .map(|(i, (key, label, color, kind))| PipelineStage {
                id: i as i64 + 1,
                team_id: 1,
                stage_key: key.into(),
                label: label.into(),
                color: color.into(),
                position: i as i32,
                kind,
            })
            .collect()
    }

    fn appt(id: i64, stage: Option<&str>, status: AppointmentStatus, closer: &str) -> Appointment {
        Appointment {
            id,
            team_id: 1,
            lead_name: format!("Lead {}", id),
            lead_email: format!("lead{}@example.com", id),
            start_time: "2026-06-01T10:00:00Z".into(),
            setter: None,
            closer: Some(closer.into()),
            cash_collected: 0.0,
            mrr_amount: 0.0,
            mrr_months: 0,
            status,
            pipeline_stage: stage.map(str::to_string),
            original_appointment_id: None,
            rescheduled_to_id: None,
            reschedule_url: None,
            reschedule_count: 0,
            calendar_invitee_ref: None,
            created_at: "2026-05-01".into(),
            updated_at: "2026-05-01".into(),
        }
    }

    fn bucket<'a>(view: &'a CloserView, key: &str) -> &'a CloserBucket {
        view.buckets.iter().find(|b| b.stage_key == key).unwrap()
    }

    #[test]
    fn test_board_columns_follow_position_order() {
        let mut stages = stages();
        stages.reverse();
        let columns = board_columns(&stages, &[]);
        assert_eq!(columns[0].stage_key, "booked");
        assert_eq!(columns.last().unwrap().stage_key, "disqualified");
    }

    #[test]
    fn test_board_unknown_and_missing_stage_go_to_booked() {
        let appts = vec![
            appt(1, None, AppointmentStatus::New, "cara"),
            appt(2, Some("deleted_stage"), AppointmentStatus::Confirmed, "cara"),
            appt(3, Some("won"), AppointmentStatus::Showed, "cara"),
        ];
        let columns = board_columns(&stages(), &appts);
        let booked = columns.iter().find(|c| c.stage_key == "booked").unwrap();
        assert_eq!(booked.appointments.len(), 2);
        let won = columns.iter().find(|c| c.stage_key == "won").unwrap();
        assert_eq!(won.appointments[0].id, 3);
    }

    #[test]
    fn test_board_without_booked_stage_adds_synthetic_column() {
        let stages: Vec<PipelineStage> = stages()
            .into_iter()
            .filter(|s| s.kind != StageKind::Booked)
            .collect();
        let columns = board_columns(&stages, &[appt(1, None, AppointmentStatus::New, "cara")]);
        assert_eq!(columns[0].label, BOOKED_BUCKET_LABEL);
        assert_eq!(columns[0].appointments.len(), 1);
    }

    #[test]
    fn test_closer_view_filters_by_closer() {
        let appts = vec![
            appt(1, Some("won"), AppointmentStatus::Showed, "cara"),
            appt(2, Some("won"), AppointmentStatus::Showed, "dev"),
        ];
        let view = closer_view(&stages(), &appts, "Cara");
        assert_eq!(view.totals.appointments, 1);
        assert_eq!(bucket(&view, "won").count, 1);
    }

    #[test]
    fn test_closer_view_booked_bucket_rules() {
        let appts = vec![
            appt(1, None, AppointmentStatus::Confirmed, "cara"),
            appt(2, Some("booked"), AppointmentStatus::Confirmed, "cara"),
            appt(3, Some("lost"), AppointmentStatus::New, "cara"),
            appt(4, Some("lost"), AppointmentStatus::Showed, "cara"),
        ];
        let view = closer_view(&stages(), &appts, "cara");
        assert_eq!(view.buckets[0].stage_key, BOOKED_BUCKET_KEY);
        assert_eq!(view.buckets[0].count, 3);
        assert_eq!(bucket(&view, "lost").count, 1);
        assert!(view.buckets.iter().all(|b| b.stage_key != "booked"));
    }

    #[test]
    fn test_closer_view_rescheduled_counted_twice() {
        let appts = vec![
            appt(1, Some("rescheduled"), AppointmentStatus::Rescheduled, "cara"),
            appt(2, Some("follow_up"), AppointmentStatus::Rescheduled, "cara"),
        ];
        let view = closer_view(&stages(), &appts, "cara");

        let booked = bucket(&view, BOOKED_BUCKET_KEY);
        assert_eq!(booked.count, 2);
        assert!(booked.cards.iter().all(|c| c.rescheduled));
        let rescheduled = bucket(&view, "rescheduled");
        assert_eq!(rescheduled.count, 2);
        assert!(rescheduled.cards.iter().all(|c| !c.rescheduled));
        assert_eq!(view.rescheduled_duplicates, 2);
        assert_eq!(view.totals.appointments, 2);
    }

    #[test]
    fn test_closer_view_revenue_sums() {
        let mut won = appt(1, Some("won"), AppointmentStatus::Showed, "cara");
        won.cash_collected = 2000.0;
        won.mrr_amount = 500.0;
        won.mrr_months = 6;
        let mut deposit = appt(2, Some("deposit"), AppointmentStatus::Showed, "cara");
        deposit.cash_collected = 300.0;
        let lost = appt(3, Some("lost"), AppointmentStatus::Showed, "cara");
        let lost_too = appt(4, Some("lost"), AppointmentStatus::Showed, "cara");

        let view = closer_view(&stages(), &[won, deposit, lost, lost_too], "cara");

        let won_bucket = bucket(&view, "won");
        assert_eq!(won_bucket.cash_collected, 2000.0);
        assert_eq!(won_bucket.mrr, 3000.0);
        assert_eq!(
            view.totals,
            CloserTotals {
                appointments: 4,
                closed_deals: 1,
                cash_collected: 2300.0,
                mrr: 3000.0,
                close_rate: 0.25,
            }
        );
    }

    #[test]
    fn test_closer_view_empty() {
        let view = closer_view(&stages(), &[], "nobody");
        assert_eq!(view.totals.appointments, 0);
        assert_eq!(view.totals.close_rate, 0.0);
        assert!(view.buckets.iter().all(|b| b.count == 0));
    }

    const STAGE_CHOICES: &[Option<&str>] = &[
        None,
        Some("booked"),
        Some("no_show"),
        Some("canceled"),
        Some("rescheduled"),
        Some("follow_up"),
        Some("deposit"),
        Some("won"),
        Some("lost"),
        Some("disqualified"),
        Some("retired_stage"),
    ];

    const STATUS_CHOICES: &[AppointmentStatus] = &[
        AppointmentStatus::New,
        AppointmentStatus::Confirmed,
        AppointmentStatus::Showed,
        AppointmentStatus::NoShow,
        AppointmentStatus::Cancelled,
        AppointmentStatus::Rescheduled,
    ];

    fn arb_appointments() -> impl Strategy<Value = Vec<Appointment>> {
        proptest::collection::vec(
            (0..STAGE_CHOICES.len(), 0..STATUS_CHOICES.len(), prop::bool::ANY),
            0..40,
        )
        .prop_map(|rows| {
            rows.into_iter()
                .enumerate()
                .map(|(i, (stage, status, mine))| {
                    appt(
                        i as i64,
                        STAGE_CHOICES[stage],
                        STATUS_CHOICES[status],
                        if mine { "cara" } else { "dev" },
                    )
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_board_never_drops_an_appointment(appts in arb_appointments()) {
            let columns = board_columns(&stages(), &appts);
            let placed: usize = columns.iter().map(|c| c.appointments.len()).sum();
            prop_assert_eq!(placed, appts.len());
        }

        #[test]
        fn prop_grouping_never_drops_an_appointment(appts in arb_appointments()) {
            let view = closer_view(&stages(), &appts, "cara");
            let mine = appts.iter().filter(|a| a.closer.as_deref() == Some("cara")).count();
            let placed: usize = view.buckets.iter().map(|b| b.count).sum();
            prop_assert_eq!(placed, mine + view.rescheduled_duplicates);

            let rescheduled = appts
                .iter()
                .filter(|a| a.closer.as_deref() == Some("cara"))
                .filter(|a| {
                    a.status == AppointmentStatus::Rescheduled
                        || a.pipeline_stage.as_deref() == Some("rescheduled")
                })
                .count();
            prop_assert_eq!(view.rescheduled_duplicates, rescheduled);
        }
    }
}
