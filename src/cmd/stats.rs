//! Pipeline figures for `dealflow stats`.

use anyhow::Result;
use std::path::Path;

use dealflow::crm::aggregation::{board_columns, closer_view};

use super::{load_config, open_database};

fn money(amount: f64) -> String {
    format!("${:.2}", amount)
}

pub fn cmd_stats(project_dir: &Path, team: i64, closer: Option<&str>) -> Result<()> {
    let config = load_config(project_dir)?;
    let db = open_database(project_dir, &config)?;
    let stages = db.list_stages(team)?;
    let appointments = db.list_appointments(team)?;

    println!();
    match closer {
        None => {
            println!("{}", console::style(format!("Team {} board", team)).bold().cyan());
            println!();
            for column in board_columns(&stages, &appointments) {
                println!("  {:<24} {:>4}", column.label, column.appointments.len());
            }
            println!();
            println!("  {:<24} {:>4}", "Total", appointments.len());
        }
        Some(name) => {
            let view = closer_view(&stages, &appointments, name);
            println!(
                "{}",
                console::style(format!("Closer {} (team {})", view.closer, team))
                    .bold()
                    .cyan()
            );
            println!();
            for bucket in &view.buckets {
                println!(
                    "  {:<24} {:>4}  cash {:>12}  mrr {:>12}",
                    bucket.label,
                    bucket.count,
                    money(bucket.cash_collected),
                    money(bucket.mrr)
                );
            }
            if view.rescheduled_duplicates > 0 {
                println!(
                    "  {}",
                    console::style(format!(
                        "{} rescheduled appointment(s) shown in two buckets",
                        view.rescheduled_duplicates
                    ))
                    .dim()
                );
            }
            let totals = &view.totals;
            println!();
            println!("  Appointments: {}", totals.appointments);
            println!("  Closed deals: {}", totals.closed_deals);
            println!("  Cash:         {}", money(totals.cash_collected));
            println!("  MRR:          {}", money(totals.mrr));
            println!(
                "  Close rate:   {}",
                console::style(format!("{:.1}%", totals.close_rate * 100.0)).green()
            );
        }
    }
    println!();
    Ok(())
}
