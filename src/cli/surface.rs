use std::{
    io::{stdout, Write},
    path::Path,
    sync::Arc,
};

use ansi_term::{Colour, Style};
use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::{
    daemon::{
        ipc::{
            protocol::{Notification, Topic},
            transport::Endpoint,
        },
        selection::{SelectionPatch, SelectionState},
        timer::{
            command::{CommandOutcome, RemoteCommand},
            state::{TimerState, TimerStatus},
            TimerApi,
        },
    },
    surface::{
        autosave::{AutoSaver, DEFAULT_AUTOSAVE_INTERVAL},
        client::{Notifications, SurfaceClient},
    },
    utils::{clock::DefaultClock, time::format_duration},
};

#[derive(Debug, clap::Args)]
pub struct TimerCommandArgs {
    #[arg(
        long,
        help = "Task to track. Defaults to the task the timer holds, then to the selected task"
    )]
    task: Option<i64>,
    #[arg(long, help = "Start the session from zero even if the task is unchanged")]
    force_reset: bool,
}

#[derive(Debug, clap::Args)]
pub struct SelectArgs {
    #[arg(long)]
    org: Option<i64>,
    #[arg(long)]
    project: Option<i64>,
    #[arg(long)]
    task: Option<i64>,
    #[arg(long, help = "Clear the selection before applying the other options")]
    clear: bool,
}

impl From<SelectArgs> for SelectionPatch {
    fn from(value: SelectArgs) -> Self {
        let cleared = value.clear.then_some(None);
        SelectionPatch {
            organization_id: value.org.map(Some).or(cleared),
            project_id: value.project.map(Some).or(cleared),
            task_id: value.task.map(Some).or(cleared),
        }
    }
}

type CliSaver = AutoSaver<SurfaceClient, SurfaceClient>;

async fn connect(dir: &Path) -> Result<(SurfaceClient, Notifications)> {
    SurfaceClient::connect(&Endpoint::for_dir(dir)).await
}

fn saver(client: &SurfaceClient, interval: u64) -> CliSaver {
    AutoSaver::new(
        client.clone(),
        client.clone(),
        Arc::new(DefaultClock),
        interval,
    )
}

pub async fn status(dir: &Path) -> Result<()> {
    let (client, _) = connect(dir).await?;
    let state = client.get_state().await?;
    let selection = client.get_selection().await?;
    println!("{}", describe_state(&state));
    println!("{}", describe_selection(&selection));
    Ok(())
}

pub async fn start(dir: &Path, args: TimerCommandArgs) -> Result<()> {
    let (client, _) = connect(dir).await?;
    let mut saver = saver(&client, DEFAULT_AUTOSAVE_INTERVAL);

    let held = client.get_state().await?.task.map(|v| v.id);
    let task_id = match (args.task, held) {
        (Some(id), _) => Some(id),
        (None, Some(_)) => None,
        (None, None) => client.get_selection().await?.task_id,
    };
    if let Some(task_id) = task_id {
        saver.select_task(Some(task_id)).await?;
    } else if held.is_none() {
        bail!("No task to track, pass --task or select one first");
    }

    let outcome = saver.start(None, args.force_reset).await?;
    println!("{}", describe_state(&outcome.state));
    Ok(())
}

pub async fn pause(dir: &Path) -> Result<()> {
    let (client, _) = connect(dir).await?;
    let outcome = saver(&client, DEFAULT_AUTOSAVE_INTERVAL).pause().await?;
    println!("{}", describe_state(&outcome.state));
    Ok(())
}

pub async fn stop(dir: &Path) -> Result<()> {
    let (client, _) = connect(dir).await?;
    let (outcome, saved) = saver(&client, DEFAULT_AUTOSAVE_INTERVAL).stop().await?;
    report_saved(&outcome, saved);
    Ok(())
}

pub async fn reset(dir: &Path) -> Result<()> {
    let (client, _) = connect(dir).await?;
    let (outcome, saved) = saver(&client, DEFAULT_AUTOSAVE_INTERVAL).reset().await?;
    report_saved(&outcome, saved);
    Ok(())
}

pub async fn select(dir: &Path, args: SelectArgs) -> Result<()> {
    let (client, _) = connect(dir).await?;
    let selection = client.update_selection(args.into()).await?;
    println!("{}", describe_selection(&selection));
    Ok(())
}

pub async fn remote(dir: &Path, command: RemoteCommand) -> Result<()> {
    let (client, _) = connect(dir).await?;
    match client.send_remote_command(command).await? {
        0 => println!("No surface is watching, start one with `timekeep watch`"),
        surfaces => println!("Sent {command} to {surfaces} surface(s)"),
    }
    Ok(())
}

/// Primary surface. Renders every timer update, auto-saves while the timer runs and performs
/// commands relayed from other surfaces, until Ctrl-C or the daemon goes away.
pub async fn watch(dir: &Path, autosave_secs: u64) -> Result<()> {
    let (client, mut notifications) = connect(dir).await?;
    for topic in [Topic::Timer, Topic::Selection, Topic::RemoteCommands] {
        client.subscribe(topic).await?;
    }
    let mut saver = saver(&client, autosave_secs);

    println!("{}", describe_selection(&client.get_selection().await?));
    let state = client.get_state().await?;
    render(&state);
    saver.on_state(&state).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = notifications.recv() => match event {
                None => {
                    println!();
                    println!("Daemon closed the connection");
                    break;
                }
                Some(Notification::TimerState(state)) => {
                    render(&state);
                    if let Err(e) = saver.on_state(&state).await {
                        warn!("Auto-save check failed {e:?}");
                    }
                }
                Some(Notification::Selection(selection)) => {
                    println!();
                    println!("{}", describe_selection(&selection));
                }
                Some(Notification::RemoteCommand(command)) => {
                    if let Err(e) = saver.handle_remote(command).await {
                        warn!("Remote {command} failed {e:?}");
                    }
                }
            },
        }
    }
    info!("Stopped watching");
    Ok(())
}

fn report_saved(outcome: &CommandOutcome, saved: bool) {
    if let Some(unsaved) = outcome.unsaved.as_ref().filter(|v| v.seconds() > 0) {
        if saved {
            println!("Stored {}", format_duration(unsaved.seconds()));
        } else {
            println!(
                "Couldn't store {}, it stays unsaved",
                format_duration(unsaved.seconds())
            );
        }
    }
    println!("{}", describe_state(&outcome.state));
}

fn render(state: &TimerState) {
    print!("\r\x1b[2K{}", describe_state(state));
    let _ = stdout().flush();
}

fn describe_state(state: &TimerState) -> String {
    let status = match state.status {
        TimerStatus::Idle => Colour::White.dimmed().paint("idle   "),
        TimerStatus::Running => Colour::Green.bold().paint("running"),
        TimerStatus::Paused => Colour::Yellow.paint("paused "),
    };
    let task = match &state.task {
        Some(task) => format!("{} (#{})", task.name, task.id),
        None => "no task".into(),
    };
    let unsaved = match state.unsaved() {
        0 => String::new(),
        seconds => Style::new()
            .dimmed()
            .paint(format!(" {seconds}s unsaved"))
            .to_string(),
    };
    format!(
        "{status} {} {task}{unsaved}",
        Style::new().bold().paint(&state.display)
    )
}

fn describe_selection(selection: &SelectionState) -> String {
    fn id(value: Option<i64>) -> String {
        value.map_or_else(|| "-".into(), |v| format!("#{v}"))
    }
    format!(
        "selected organization {} project {} task {}",
        id(selection.organization_id),
        id(selection.project_id),
        id(selection.task_id)
    )
}
