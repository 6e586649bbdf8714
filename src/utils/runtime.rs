use anyhow::Result;

/// The daemon runs the engine, the checkpoint writers and every client connection on one thread,
/// so engine mutations are naturally serialized.
pub fn single_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
