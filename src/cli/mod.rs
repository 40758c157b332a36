mod args;
mod lock_command;
mod run_command;

use pslock::{DistributedMutex, PsLock, Result};
pub use args::{Args, Command, LockArgs};

/// Runs the parsed command and returns the process exit code.
pub async fn run(args: Args) -> Result<i32> {
    match args.command {
        Command::Run { name, command } => {
            run_command::execute_run(&args.lock, &name, &command).await
        }
        Command::Lock { name } => lock_command::execute_lock(&args.lock, &name).await,
        Command::Unlock { name, token } => {
            lock_command::execute_unlock(&args.lock, &name, token.as_deref()).await
        }
    }
}

/// Validates options before touching the network, then connects.
async fn open_mutex(lock_args: &LockArgs, name: &str) -> Result<DistributedMutex> {
    let options = lock_args.mutex_options();
    options.validate()?;

    let locks = PsLock::connect(&lock_args.redis_url).await?;
    locks.mutex(name, options)
}
