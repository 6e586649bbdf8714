pub mod daemon_path;
pub mod entries;
pub mod process;
pub mod records;
pub mod surface;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use entries::{process_entries_command, EntriesCommand};
use records::{process_record_command, RecordCommand};
use surface::{SelectArgs, TimerCommandArgs};
use tracing::level_filters::LevelFilter;

use crate::{
    daemon::{start_daemon, storage::entities::RecordKind, timer::command::RemoteCommand},
    surface::autosave::DEFAULT_AUTOSAVE_INTERVAL,
    utils::{
        dir::resolve_application_path,
        logging::{enable_logging, CLI_PREFIX, DAEMON_PREFIX},
    },
};

#[derive(Parser, Debug)]
#[command(name = "timekeep", version, long_about = None)]
#[command(about = "Task time tracker with a background timer", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, help = "Enable logging")]
    log: bool,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Starts a daemon for the application, replacing a running one")]
    Init,
    #[command(
        about = "Run a daemon directly in current console. Used for debugging"
    )]
    Serve,
    #[command(about = "Stop currently running daemon. Unsaved time is stored first")]
    Shutdown {
        #[arg(long, help = "Kill daemon processes that don't answer")]
        force: bool,
    },
    #[command(about = "Show the timer and the current selection")]
    Status,
    #[command(about = "Start the timer")]
    Start {
        #[command(flatten)]
        args: TimerCommandArgs,
    },
    #[command(about = "Pause the timer")]
    Pause,
    #[command(about = "Stop the timer and store the tracked time")]
    Stop,
    #[command(about = "Store the tracked time and clear the timer")]
    Reset,
    #[command(about = "Change the selected organization, project and task")]
    Select {
        #[command(flatten)]
        args: SelectArgs,
    },
    #[command(
        about = "Follow the timer live. Acts as the primary surface: auto-saves and performs remote commands"
    )]
    Watch {
        #[arg(
            long,
            default_value_t = DEFAULT_AUTOSAVE_INTERVAL,
            help = "Seconds of running time between auto-saves"
        )]
        autosave_secs: u64,
    },
    #[command(about = "Ask the watching surface to start, pause or stop the timer")]
    Remote { command: RemoteCommand },
    #[command(about = "Manage organizations")]
    Org {
        #[command(subcommand)]
        command: RecordCommand,
    },
    #[command(about = "Manage projects")]
    Project {
        #[command(subcommand)]
        command: RecordCommand,
    },
    #[command(about = "Manage tasks")]
    Task {
        #[command(subcommand)]
        command: RecordCommand,
    },
    #[command(about = "List and edit tracked time")]
    Entries {
        #[command(subcommand)]
        command: EntriesCommand,
    },
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();
    let dir = resolve_application_path(args.dir)?;

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    let prefix = match args.commands {
        Commands::Serve => DAEMON_PREFIX,
        _ => CLI_PREFIX,
    };
    enable_logging(prefix, &dir, logging_level, args.log)?;

    match args.commands {
        Commands::Init => process::restart_daemon(&dir).await,
        Commands::Serve => start_daemon(dir).await,
        Commands::Shutdown { force } => process::shutdown_daemon(&dir, force).await,
        Commands::Status => surface::status(&dir).await,
        Commands::Start { args } => surface::start(&dir, args).await,
        Commands::Pause => surface::pause(&dir).await,
        Commands::Stop => surface::stop(&dir).await,
        Commands::Reset => surface::reset(&dir).await,
        Commands::Select { args } => surface::select(&dir, args).await,
        Commands::Watch { autosave_secs } => surface::watch(&dir, autosave_secs).await,
        Commands::Remote { command } => surface::remote(&dir, command).await,
        Commands::Org { command } => {
            process_record_command(&dir, RecordKind::Organization, command).await
        }
        Commands::Project { command } => {
            process_record_command(&dir, RecordKind::Project, command).await
        }
        Commands::Task { command } => process_record_command(&dir, RecordKind::Task, command).await,
        Commands::Entries { command } => process_entries_command(&dir, command).await,
    }
}
