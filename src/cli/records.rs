use std::path::Path;

use anyhow::{bail, Result};
use clap::Subcommand;

use crate::{
    daemon::{
        ipc::transport::Endpoint,
        storage::{
            entities::{NewRecord, Record, RecordKind, RecordPatch, RecordStatus},
            store::CatalogStore,
        },
    },
    surface::client::SurfaceClient,
};

#[derive(Subcommand, Debug)]
pub enum RecordCommand {
    #[command(about = "Create a record")]
    Add {
        name: String,
        #[arg(long, help = "Owning organization of a project, or owning project of a task")]
        parent: Option<i64>,
        #[arg(long, help = "Only used for projects")]
        description: Option<String>,
    },
    #[command(about = "List records")]
    List {
        #[arg(long, help = "Only list records owned by this parent")]
        parent: Option<i64>,
    },
    #[command(about = "Rename a record or change its status")]
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        status: Option<RecordStatus>,
        #[arg(long)]
        description: Option<String>,
    },
    #[command(about = "Delete a record with everything it owns, tracked time included")]
    Delete { id: i64 },
}

pub async fn process_record_command(
    dir: &Path,
    kind: RecordKind,
    command: RecordCommand,
) -> Result<()> {
    let (client, _) = SurfaceClient::connect(&Endpoint::for_dir(dir)).await?;
    match command {
        RecordCommand::Add {
            name,
            parent,
            description,
        } => {
            let record = client
                .create_record(new_record(kind, name, parent, description)?)
                .await?;
            println!("Created {}", describe(&record));
        }
        RecordCommand::List { parent } => {
            let records = client.list_records(kind, parent).await?;
            if records.is_empty() {
                println!("No {kind} records");
            }
            for record in records {
                println!("{}", describe(&record));
            }
        }
        RecordCommand::Update {
            id,
            name,
            status,
            description,
        } => {
            let record = client
                .update_record(
                    kind,
                    id,
                    RecordPatch {
                        name,
                        status,
                        description,
                    },
                )
                .await?;
            println!("Updated {}", describe(&record));
        }
        RecordCommand::Delete { id } => {
            client.delete_record(kind, id).await?;
            println!("Deleted {kind} #{id}");
        }
    }
    Ok(())
}

fn new_record(
    kind: RecordKind,
    name: String,
    parent: Option<i64>,
    description: Option<String>,
) -> Result<NewRecord> {
    let record = match (kind, parent) {
        (RecordKind::Organization, None) => NewRecord::Organization { name },
        (RecordKind::Organization, Some(_)) => bail!("Organizations have no parent"),
        (RecordKind::Project, Some(organization_id)) => NewRecord::Project {
            organization_id,
            name,
            description,
        },
        (RecordKind::Task, Some(project_id)) => NewRecord::Task { project_id, name },
        (kind, None) => bail!("A {kind} needs --parent"),
    };
    Ok(record)
}

fn describe(record: &Record) -> String {
    let parent = record
        .parent_id()
        .map(|v| format!(" in #{v}"))
        .unwrap_or_default();
    format!(
        "{} #{} {}{parent} [{}]",
        record.kind(),
        record.id(),
        record.name(),
        record.status()
    )
}
