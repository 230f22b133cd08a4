use clap::Args;
use clap::Parser;
use clap::Subcommand;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;
use std::time::Instant;
use wp_channel::ChannelSettings;
use wp_channel::ControlChannel;
use wp_channel::EngineFamily;
use wp_channel::MessageStore;
use wp_channel::ReliabilityPolicy;
use wp_core::ProxyError;
use wp_core::ProxyResult;
use wp_net::HttpServiceTransport;
use wp_net::ServiceTransport;
use wp_storage::FileKeyValueStore;
use wp_storage::KeyValueStore;
use wp_storage::StoreConfig;

const DEFAULT_PARTITION: &str = "global";
const DEFAULT_REPLAY_TIMEOUT_MS: u64 = 10_000;

#[derive(Parser)]
#[command(name = "waypoint-agent")]
#[command(version)]
#[command(about = "Inspect and replay control messages the proxy never confirmed")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// Directory holding the persisted partitions
    #[arg(long)]
    data_dir: PathBuf,
    #[arg(long, default_value = DEFAULT_PARTITION)]
    partition: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the messages persisted for a session, one JSON object per line
    Pending {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        session: String,
    },
    /// Re-send persisted messages to the service endpoint and wait for them
    Replay {
        #[command(flatten)]
        store: StoreArgs,
        /// JSON settings document, as injected into the page
        #[arg(long)]
        settings: PathBuf,
        /// User agent of the page; picks the failure policy
        #[arg(long)]
        user_agent: Option<String>,
        #[arg(long, default_value_t = DEFAULT_REPLAY_TIMEOUT_MS)]
        timeout_ms: u64,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Pending { store, session } => print_pending(&store, &session),
        Commands::Replay {
            store,
            settings,
            user_agent,
            timeout_ms,
        } => replay(
            &store,
            &settings,
            user_agent.as_deref(),
            Duration::from_millis(timeout_ms),
        ),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn open_store(args: &StoreArgs) -> ProxyResult<MessageStore<FileKeyValueStore>> {
    let backend = FileKeyValueStore::new(
        StoreConfig::for_partition(args.partition.clone()),
        args.data_dir.clone(),
    )?;
    Ok(MessageStore::new(backend))
}

/// Outcome of replaying one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReplaySummary {
    replayed: usize,
    parked: usize,
}

fn print_pending(args: &StoreArgs, session: &str) -> ProxyResult<()> {
    for line in pending_lines(&open_store(args)?, session)? {
        println!("{line}");
    }

    Ok(())
}

fn pending_lines<S: KeyValueStore>(
    store: &MessageStore<S>,
    session: &str,
) -> ProxyResult<Vec<String>> {
    store
        .load(session)
        .iter()
        .map(|record| {
            serde_json::to_string(record).map_err(|error| {
                ProxyError::new(
                    "agent.output_failed",
                    format!("failed to render pending message: {error}"),
                )
            })
        })
        .collect()
}

fn replay(
    args: &StoreArgs,
    settings_path: &Path,
    user_agent: Option<&str>,
    timeout: Duration,
) -> ProxyResult<()> {
    let document = fs::read_to_string(settings_path).map_err(|error| {
        ProxyError::new(
            "agent.settings_unreadable",
            format!("failed to read {}: {error}", settings_path.display()),
        )
    })?;
    let settings = ChannelSettings::from_json(&document)?;
    let session = settings.session_id.clone();

    let policy = user_agent
        .map(EngineFamily::from_user_agent)
        .map(ReliabilityPolicy::for_engine)
        .unwrap_or_default();
    let transport = HttpServiceTransport::with_timeout(timeout)?;
    let channel = ControlChannel::new(settings, policy, transport, open_store(args)?)?;

    let started = Instant::now();
    let summary = replay_session(&channel, timeout)?;
    if summary.replayed == 0 {
        log::info!("nothing pending for session {session}");
    } else {
        log::info!(
            "replayed {} messages for session {session} in {:?}; {} parked again",
            summary.replayed,
            started.elapsed(),
            summary.parked
        );
    }
    Ok(())
}

fn replay_session<T, S>(
    channel: &ControlChannel<T, S>,
    timeout: Duration,
) -> ProxyResult<ReplaySummary>
where
    T: ServiceTransport,
    S: KeyValueStore + 'static,
{
    let session = channel.settings().session_id.clone();
    let pending = channel.store().load(&session).len();
    if pending == 0 {
        return Ok(ReplaySummary {
            replayed: 0,
            parked: 0,
        });
    }

    let started = Instant::now();
    let (replayed_tx, replayed_rx) = mpsc::channel();
    channel.replay_persisted(move || {
        let _ = replayed_tx.send(());
    });
    if replayed_rx.recv_timeout(timeout).is_err() {
        return Err(ProxyError::new(
            "agent.replay_timeout",
            format!("{pending} messages not completed within {timeout:?}"),
        ));
    }

    let (idle_tx, idle_rx) = mpsc::channel();
    channel.await_quiescence(timeout.saturating_sub(started.elapsed()), move || {
        let _ = idle_tx.send(());
    });
    let _ = idle_rx.recv_timeout(timeout);

    Ok(ReplaySummary {
        replayed: pending,
        parked: channel.store().load(&session).len(),
    })
}
