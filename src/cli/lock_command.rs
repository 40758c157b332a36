use crate::cli::{open_mutex, LockArgs};
use pslock::cancel::shutdown_token;
use pslock::{CancellationToken, Result};
use tracing::info;

pub async fn execute_lock(lock_args: &LockArgs, name: &str) -> Result<i32> {
    let mutex = open_mutex(lock_args, name).await?;
    let cancel = shutdown_token();

    let acquisition = mutex.lock(&cancel).await?;
    info!(
        "Lock acquired: {} (via {:?}, waited {:?}); expires in {:?} unless released",
        mutex.key(),
        acquisition.via(),
        acquisition.waited(),
        mutex.options().expiry
    );
    if lock_args.fencing {
        // The token is needed to release a fenced lock from another process.
        println!("{}", acquisition.value());
    }

    Ok(0)
}

pub async fn execute_unlock(lock_args: &LockArgs, name: &str, token: Option<&str>) -> Result<i32> {
    let mutex = open_mutex(lock_args, name).await?;
    let cancel = CancellationToken::new();

    match token {
        Some(token) => mutex.unlock_token(token, &cancel).await?,
        None => mutex.unlock(&cancel).await?,
    }
    info!("Lock released: {}", mutex.key());

    Ok(0)
}
