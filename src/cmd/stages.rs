//! Pipeline stage commands for `dealflow stages`.

use anyhow::Result;
use std::path::Path;

use super::super::StagesCommands;
use super::{load_config, open_database};

pub fn cmd_stages(project_dir: &Path, command: StagesCommands) -> Result<()> {
    let config = load_config(project_dir)?;
    let db = open_database(project_dir, &config)?;

    let (team, stages) = match command {
        StagesCommands::Seed { team } => {
            let stages = db.seed_default_stages(team)?;
            println!("Team {} has {} stages.", team, stages.len());
            (team, stages)
        }
        StagesCommands::List { team } => (team, db.list_stages(team)?),
    };

    if stages.is_empty() {
        println!("No stages for team {}. Run 'dealflow stages seed --team {}'.", team, team);
        return Ok(());
    }

    println!();
    for stage in &stages {
        println!(
            "  {:>2}. {:<20} {:<22} {:<12} {}",
            stage.position,
            stage.stage_key,
            stage.label,
            stage.kind.as_str(),
            console::style(&stage.color).dim()
        );
    }
    println!();
    Ok(())
}
