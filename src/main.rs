use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt};

use keyrelay::relay::{
    DEFAULT_BIND, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_ENGINEERS, DEFAULT_RELOAD_INTERVAL,
};
use keyrelay::{CredentialStore, Relay, RelayConfig, SqliteBackend, UserSlotPolicy};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum UserPolicyArg {
    /// A new user connection replaces the existing one.
    Replace,
    /// A new user connection is refused while one exists.
    Reject,
}

impl From<UserPolicyArg> for UserSlotPolicy {
    fn from(arg: UserPolicyArg) -> Self {
        match arg {
            UserPolicyArg::Replace => UserSlotPolicy::ReplaceExisting,
            UserPolicyArg::Reject => UserSlotPolicy::RejectNew,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "keyrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Key database shared with the keydb tool.
    #[arg(long, default_value = "keys.db")]
    keydb: PathBuf,

    #[arg(short, long, default_value_t = DEFAULT_BIND)]
    bind: IpAddr,

    #[arg(long, default_value_t = DEFAULT_MAX_ENGINEERS)]
    max_engineers: usize,

    /// Seconds without traffic before a connection is closed.
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    idle_timeout: u64,

    #[arg(long, value_enum, default_value = "replace")]
    user_policy: UserPolicyArg,

    /// Seconds between key database rescans for new ports.
    #[arg(long, default_value_t = DEFAULT_RELOAD_INTERVAL.as_secs())]
    reload_interval: u64,

    /// PEM certificate chain; enables secure WebSocket together with --tls-key.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let backend = SqliteBackend::open(&args.keydb)
        .with_context(|| format!("failed to open key database {}", args.keydb.display()))?;

    let config = RelayConfig {
        bind: args.bind,
        max_engineers: args.max_engineers,
        idle_timeout: Duration::from_secs(args.idle_timeout),
        user_policy: args.user_policy.into(),
        reload_interval: Duration::from_secs(args.reload_interval.max(1)),
        tls_cert: args.tls_cert,
        tls_key: args.tls_key,
    };

    let relay = Relay::start(CredentialStore::new(backend), config).await?;
    relay.run().await
}
