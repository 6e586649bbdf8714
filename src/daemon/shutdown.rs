use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels `cancelation` on Ctrl-C or SIGTERM, and returns as soon as it is cancelled for any
/// other reason, such as a shutdown request from a surface.
///
/// On Windows detached processes can't receive console signals, there the IPC shutdown request is
/// the only way to stop the daemon gracefully.
pub async fn detect_shutdown(cancelation: CancellationToken) {
    select! {
        _ = cancelation.cancelled() => {},
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C");
            cancelation.cancel();
        },
        _ = terminate() => {
            info!("Received SIGTERM");
            cancelation.cancel();
        },
    };
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            tracing::warn!("Couldn't listen for SIGTERM {e:?}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
