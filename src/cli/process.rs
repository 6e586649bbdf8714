use std::{env, path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, Result};
use sysinfo::{get_current_pid, Signal, System};
use tracing::{debug, info, warn};

use crate::{
    daemon::{instance::InstanceLock, ipc::transport::Endpoint},
    surface::client::SurfaceClient,
};

use super::daemon_path::to_daemon_path;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Kills every process started from `name`. Returns how many were found.
pub fn kill_previous_daemons(name: &Path) -> Result<usize> {
    let system = System::new_all();
    let current_id = get_current_pid().map_err(|e| anyhow!("Can't read own pid {e}"))?;
    let mut killed = 0;
    for (pid, process) in system.processes().iter() {
        if *pid == current_id {
            continue;
        }

        if process
            .exe()
            .filter(|v| v.exists())
            .filter(|v| name == *v)
            .is_some()
        {
            debug!("Killing daemon {pid}");
            // This will forcefully terminate the process on Windows, where the final flush is lost.
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
            process.wait();
            killed += 1;
        }
    }
    Ok(killed)
}

/// Asks the daemon of `dir` to stop and waits until the process released the directory, which
/// happens after its final flush and checkpoint. Returns `false` if no daemon answered.
pub async fn request_shutdown(dir: &Path) -> Result<bool> {
    let Ok((client, _)) = SurfaceClient::connect(&Endpoint::for_dir(dir)).await else {
        return Ok(false);
    };
    client.shutdown_daemon().await?;

    let released = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while InstanceLock::acquire(dir).is_err() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if released.is_err() {
        warn!("Daemon didn't exit in {SHUTDOWN_TIMEOUT:?}");
    }
    Ok(true)
}

pub async fn shutdown_daemon(dir: &Path, force: bool) -> Result<()> {
    if request_shutdown(dir).await? {
        println!("Daemon stopped");
    } else if !force {
        println!("No daemon is running for {dir:?}");
    }
    if force {
        let killed = kill_previous_daemons(&to_daemon_path(env::current_exe()?))?;
        if killed > 0 {
            println!("Killed {killed} daemon processes");
        }
    }
    Ok(())
}

/// Stops the daemon of `dir`, if there is one, and starts a new detached one.
pub async fn restart_daemon(dir: &Path) -> Result<()> {
    if request_shutdown(dir).await? {
        info!("Stopped the previous daemon");
    }

    let daemon_path = to_daemon_path(env::current_exe()?);
    let mut command = std::process::Command::new(&daemon_path);
    command.arg("--dir").arg(dir);

    #[cfg(feature = "win")]
    {
        use std::os::windows::process::CommandExt;
        use windows::Win32::System::Threading::DETACHED_PROCESS;
        command.creation_flags(DETACHED_PROCESS.0);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());

    debug!("Spawning {daemon_path:?}");
    #[allow(clippy::zombie_processes)]
    let _ = command.spawn()?;
    println!("Daemon started for {dir:?}");
    Ok(())
}
