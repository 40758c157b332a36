use crate::cli::{open_mutex, LockArgs};
use pslock::cancel::shutdown_token;
use pslock::{CancellationToken, LockError, Result};
use tokio::process::Command;
use tracing::{info, warn};

pub async fn execute_run(lock_args: &LockArgs, name: &str, command: &[String]) -> Result<i32> {
    let (program, program_args) = command
        .split_first()
        .ok_or_else(|| LockError::Other("Command required".to_string()))?;

    let mutex = open_mutex(lock_args, name).await?;
    let acquisition = mutex.lock(&shutdown_token()).await?;
    if acquisition.is_degraded() {
        warn!("Acquired {} without release notifications", mutex.key());
    }
    info!("Lock acquired: {} (waited {:?})", mutex.key(), acquisition.waited());

    let status = Command::new(program).args(program_args).status().await;

    // Release even if the command could not be started. A fresh token so an
    // interrupt that reached the child does not also skip the release.
    let release = CancellationToken::new();
    let released = if lock_args.fencing {
        mutex.unlock_owned(&acquisition, &release).await
    } else {
        mutex.unlock(&release).await
    };

    let status = status.map_err(|e| LockError::Other(format!("Failed to run {}: {}", program, e)))?;
    released?;
    info!("Lock released: {}", mutex.key());

    Ok(status.code().unwrap_or(1))
}
