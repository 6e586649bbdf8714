use std::{collections::HashMap, fmt::Display, path::Path};

use anyhow::Result;
use chrono::{DateTime, Duration, Local, Utc};
use chrono_english::parse_date_string;
use clap::{CommandFactory, Subcommand, ValueEnum};
use now::DateTimeNow;

use crate::{
    daemon::{
        ipc::transport::Endpoint,
        storage::{
            entities::{Record, RecordKind, TimeEntry, TimeEntryFilter, TimeEntryPatch},
            store::{CatalogStore, TimeEntryStore},
        },
    },
    surface::client::SurfaceClient,
    utils::time::{format_duration, next_day_start},
};

use super::Args;

const DEFAULT_LISTED_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DateStyle {
    Uk,
    Us,
}

impl From<DateStyle> for chrono_english::Dialect {
    fn from(value: DateStyle) -> Self {
        match value {
            DateStyle::Uk => Self::Uk,
            DateStyle::Us => Self::Us,
        }
    }
}

impl Display for DateStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateStyle::Uk => write!(f, "uk"),
            DateStyle::Us => write!(f, "us"),
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct RangeArgs {
    #[arg(
        long = "start",
        short,
        help = "Start of the range. Examples are \"yesterday\", \"1 hour ago\", \"15/03/2025\", \"12:00 16/03/2025\". Defaults to a week ago"
    )]
    start_date: Option<String>,
    #[arg(long = "end", short, help = "End of the range. Defaults to now")]
    end_date: Option<String>,
    #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
    date_style: DateStyle,
    #[arg(
        long = "days",
        default_value_t = false,
        help = "Take inputs as whole days. For example if start and end are both 15/03/2025 this option lists the whole day"
    )]
    treat_as_days: bool,
}

#[derive(Debug, clap::Args)]
pub struct FilterArgs {
    #[arg(long)]
    org: Option<i64>,
    #[arg(long)]
    project: Option<i64>,
    #[arg(long)]
    task: Option<i64>,
}

#[derive(Subcommand, Debug)]
pub enum EntriesCommand {
    #[command(about = "List tracked time, newest first")]
    List {
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        range: RangeArgs,
    },
    #[command(about = "Change the duration, time or notes of an entry")]
    Edit {
        id: i64,
        #[arg(long, help = "New duration in seconds")]
        seconds: Option<u64>,
        #[arg(long, help = "New time of the entry, in the same formats as list --start")]
        at: Option<String>,
        #[arg(long, default_value_t = DateStyle::Uk)]
        date_style: DateStyle,
        #[arg(long)]
        notes: Option<String>,
    },
    #[command(about = "Delete an entry")]
    Delete { id: i64 },
}

pub async fn process_entries_command(dir: &Path, command: EntriesCommand) -> Result<()> {
    let (client, _) = SurfaceClient::connect(&Endpoint::for_dir(dir)).await?;
    match command {
        EntriesCommand::List { filter, range } => list(&client, filter, range).await,
        EntriesCommand::Edit {
            id,
            seconds,
            at,
            date_style,
            notes,
        } => {
            let timestamp = match at {
                Some(at) => Some(parse_date(&at, date_style, "entry")?.with_timezone(&Utc)),
                None => None,
            };
            let entry = client
                .update_time_entry(
                    id,
                    TimeEntryPatch {
                        duration: seconds,
                        timestamp,
                        notes,
                    },
                )
                .await?;
            println!(
                "Updated entry #{} {} at {}",
                entry.id,
                format_duration(entry.duration),
                entry.timestamp.with_timezone(&Local).format("%x %H:%M")
            );
            Ok(())
        }
        EntriesCommand::Delete { id } => {
            client.delete_time_entry(id).await?;
            println!("Deleted entry #{id}");
            Ok(())
        }
    }
}

async fn list(client: &SurfaceClient, filter: FilterArgs, range: RangeArgs) -> Result<()> {
    let (start, end) = parse_range(range)?;
    let entries = client
        .get_time_entries(TimeEntryFilter {
            organization_id: filter.org,
            project_id: filter.project,
            task_id: filter.task,
        })
        .await?;
    let entries = entries
        .into_iter()
        .filter(|v| v.timestamp >= start && v.timestamp < end)
        .collect::<Vec<_>>();

    let names = TaskNames::load(client).await?;
    for entry in &entries {
        print_entry(entry, &names);
    }
    let total: u64 = entries.iter().map(|v| v.duration).sum();
    println!(
        "Total {} in {} entries",
        format_duration(total),
        entries.len()
    );
    Ok(())
}

fn print_entry(entry: &TimeEntry, names: &TaskNames) {
    println!(
        "#{}\t{}\t{}\t{}\t{}",
        entry.id,
        entry.timestamp.with_timezone(&Local).format("%x %H:%M"),
        format_duration(entry.duration),
        names.path(entry.task_id),
        entry.notes.as_deref().unwrap_or_default()
    );
}

/// `organization / project / task` labels for every task.
struct TaskNames {
    records: HashMap<(RecordKind, i64), Record>,
}

impl TaskNames {
    async fn load(client: &SurfaceClient) -> Result<Self> {
        let mut records = HashMap::new();
        for kind in [RecordKind::Organization, RecordKind::Project, RecordKind::Task] {
            for record in client.list_records(kind, None).await? {
                records.insert((kind, record.id()), record);
            }
        }
        Ok(Self { records })
    }

    fn path(&self, task_id: i64) -> String {
        let name = |kind: RecordKind, id: i64| {
            self.records
                .get(&(kind, id))
                .map(|v| v.name().to_string())
                .unwrap_or_else(|| format!("#{id}"))
        };
        let project_id = self
            .records
            .get(&(RecordKind::Task, task_id))
            .and_then(Record::parent_id);
        let organization_id = project_id
            .and_then(|id| self.records.get(&(RecordKind::Project, id)))
            .and_then(Record::parent_id);
        match (organization_id, project_id) {
            (Some(organization_id), Some(project_id)) => format!(
                "{} / {} / {}",
                name(RecordKind::Organization, organization_id),
                name(RecordKind::Project, project_id),
                name(RecordKind::Task, task_id)
            ),
            _ => name(RecordKind::Task, task_id),
        }
    }
}

fn parse_date(value: &str, date_style: DateStyle, name: &str) -> Result<DateTime<Local>> {
    match parse_date_string(value, Local::now(), date_style.into()) {
        Ok(v) => Ok(v.with_timezone(&Local)),
        Err(e) => Err(Args::command()
            .error(
                clap::error::ErrorKind::ValueValidation,
                format!("Failed to validate {name} date {e}"),
            )
            .into()),
    }
}

/// Also provides sensible defaults for the listed range.
fn parse_range(range: RangeArgs) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let mut start = match range.start_date {
        Some(v) => parse_date(&v, range.date_style, "start")?,
        None => Local::now() - Duration::days(DEFAULT_LISTED_DAYS),
    };
    let mut end = match range.end_date {
        Some(v) => parse_date(&v, range.date_style, "end")?,
        None => Local::now(),
    };
    if range.treat_as_days {
        start = start.beginning_of_day();
        end = next_day_start(end);
    }
    Ok((start.with_timezone(&Utc), end.with_timezone(&Utc)))
}
