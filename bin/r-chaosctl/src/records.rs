//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "CLI actions for browsing persisted experiment records."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{bail, Context, Result};
use clap::Subcommand;
use r_chaos_common::AppConfig;
use r_chaos_persistence::FileExperimentStore;
use serde_json::json;

use crate::print_json;

#[derive(Debug, Subcommand)]
pub enum RecordsCommand {
    #[command(about = "List stored record identifiers with their integrity status")]
    List,
    #[command(about = "Print one stored record")]
    Show {
        #[arg(value_name = "ID")]
        id: String,
    },
}

pub fn run(config: &AppConfig, cmd: RecordsCommand) -> Result<()> {
    if !config.persistence.enabled {
        bail!("persistence is disabled in the active configuration");
    }
    let directory = &config.persistence.directory;
    let store = FileExperimentStore::open(directory)
        .with_context(|| format!("unable to open record store at {}", directory.display()))?;

    match cmd {
        RecordsCommand::List => {
            for id in store.list()? {
                let verified = store.verify(&id);
                print_json(&json!({ "id": id, "verified": verified }))?;
            }
        }
        RecordsCommand::Show { id } => {
            let record = store
                .load(&id)
                .with_context(|| format!("unable to load record {id}"))?;
            print_json(&record)?;
        }
    }
    Ok(())
}
