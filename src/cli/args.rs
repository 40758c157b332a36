use clap::{Args as ClapArgs, Parser, Subcommand};
use pslock::lock::{MutexOptions, SubscribeFailurePolicy, DEFAULT_TRIES};
use pslock::utils::parse_duration;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "pslock",
    version,
    about = "Distributed locks over Redis with pub/sub release notifications",
    long_about = None
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub lock: LockArgs,

    /// Verbose output (repeat for more)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short = 'q', long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct LockArgs {
    /// Redis server URL
    #[arg(
        long,
        env = "PSLOCK_REDIS_URL",
        default_value = "redis://127.0.0.1:6379",
        global = true
    )]
    pub redis_url: String,

    /// Lock record TTL (e.g. "8s", "500ms")
    #[arg(
        long,
        value_name = "DURATION",
        default_value = "8s",
        value_parser = duration_arg,
        global = true
    )]
    pub expiry: Duration,

    /// Longest time to wait for a held lock
    #[arg(
        long,
        value_name = "DURATION",
        default_value = "8s",
        value_parser = duration_arg,
        global = true
    )]
    pub patience: Duration,

    /// Poll attempt budget while waiting
    #[arg(long, value_name = "N", default_value_t = DEFAULT_TRIES, global = true)]
    pub tries: u32,

    /// Fixed delay between polls (default: random 50-250ms)
    #[arg(long, value_name = "DURATION", value_parser = duration_arg, global = true)]
    pub retry_delay: Option<Duration>,

    /// Diagnostic name for this holder
    #[arg(long, value_name = "NAME", global = true)]
    pub holder: Option<String>,

    /// Write a unique token and release only if it still matches
    #[arg(long, global = true)]
    pub fencing: bool,

    /// Fail instead of polling when release notifications are unavailable
    #[arg(long, global = true)]
    pub strict_subscribe: bool,
}

impl LockArgs {
    pub fn mutex_options(&self) -> MutexOptions {
        let mut options = MutexOptions::new()
            .with_expiry(self.expiry)
            .with_patience(self.patience)
            .with_tries(self.tries)
            .with_fencing(self.fencing);

        if let Some(delay) = self.retry_delay {
            options = options.with_retry_delay(delay);
        }
        if let Some(holder) = &self.holder {
            options = options.with_name(holder.clone());
        }
        if self.strict_subscribe {
            options = options.with_subscribe_failure_policy(SubscribeFailurePolicy::Fail);
        }
        options
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Hold the lock while running a command
    Run {
        /// Lock name
        #[arg(value_name = "NAME")]
        name: String,

        /// Command and arguments to run
        #[arg(value_name = "COMMAND", trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Acquire the lock and exit; it is held until released or expired
    Lock {
        /// Lock name
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Release the lock and notify waiters
    Unlock {
        /// Lock name
        #[arg(value_name = "NAME")]
        name: String,

        /// Release only if the record still holds this fencing token
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,
    },
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}
