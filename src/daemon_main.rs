// This runs daemon on windows without creating a console. Disable during development to see
// stdout.
#![windows_subsystem = "windows"]

use std::{env::args, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use timekeep::{
    daemon::{args::DaemonArgs, start_daemon},
    utils::{
        dir::resolve_application_path,
        logging::{enable_logging, DAEMON_PREFIX},
        runtime::single_thread_runtime,
    },
};

/// Which side of the detach this process ended up on.
enum Launch {
    /// The launcher, which has nothing left to do.
    Launcher,
    /// The process that hosts the timer.
    Host,
}

fn main() -> Result<()> {
    let command_args = args().collect::<Vec<_>>();
    let args = DaemonArgs::parse_from(&command_args);
    // Resolved before detaching, the detached process doesn't keep the launcher's cwd.
    let app_dir = resolve_application_path(args.dir.clone())?;

    let launch = if args.force {
        Launch::Host
    } else {
        detach(&command_args)?
    };
    match launch {
        Launch::Launcher => {
            println!("Created daemon for {}", app_dir.display());
            Ok(())
        }
        Launch::Host => host(args, app_dir),
    }
}

#[cfg(feature = "win")]
fn detach(command_args: &[String]) -> Result<Launch> {
    use std::{
        os::windows::process::CommandExt,
        process::{Command, Stdio},
    };
    use windows::Win32::System::Threading::DETACHED_PROCESS;

    let mut command = Command::new(std::env::current_exe()?);
    command
        .args(command_args.iter().skip(1))
        .arg("--force")
        .creation_flags(DETACHED_PROCESS.0)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[allow(clippy::zombie_processes)]
    command.spawn()?;
    Ok(Launch::Launcher)
}

#[cfg(all(unix, not(feature = "win")))]
fn detach(_command_args: &[String]) -> Result<Launch> {
    use daemonize::{Daemonize, Outcome, Stdio};
    use tracing::error;

    match Daemonize::new()
        .stdout(Stdio::devnull())
        .stderr(Stdio::devnull())
        .execute()
    {
        Outcome::Parent(parent) => {
            parent.inspect_err(|e| error!("Failed to create daemon on parent side {e:?}"))?;
            Ok(Launch::Launcher)
        }
        Outcome::Child(child) => Ok(child.map(|_| Launch::Host)?),
    }
}

/// Windows builds without the `win` feature can't detach and stay in the foreground.
#[cfg(not(any(unix, feature = "win")))]
fn detach(_command_args: &[String]) -> Result<Launch> {
    Ok(Launch::Host)
}

fn host(args: DaemonArgs, app_dir: PathBuf) -> Result<()> {
    enable_logging(DAEMON_PREFIX, &app_dir, args.log, args.log_console)?;
    single_thread_runtime()?.block_on(start_daemon(app_dir))
}
