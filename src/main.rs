// ptactl: inspect and control pwnthemall challenge instances from a terminal.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pwnthemall_instances::config::{ConfigError, Overrides};
use pwnthemall_instances::models::ChallengeSummary;
use pwnthemall_instances::poller::{self, BatchMode, CollectionPoller};
use pwnthemall_instances::realtime::RealtimeListener;
use pwnthemall_instances::store::{FetchOutcome, StoreEvent};
use pwnthemall_instances::{
    metrics, render, ApiError, ChallengeId, Config, HttpInstanceClient, InstanceApi,
    InstanceController, InstanceStore, InstanceView,
};

#[derive(Parser)]
#[command(name = "ptactl")]
#[command(version, about = "Inspect and control pwnthemall challenge instances", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Backend origin, e.g. https://ctf.example.org
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Bearer token sent with every request
    #[arg(long, global = true)]
    token: Option<String>,

    /// Print prometheus metrics to stdout before exiting
    #[arg(long, global = true)]
    metrics: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Show the instance of one challenge
    Status { id: ChallengeId },

    /// Start (or restart) an instance
    Start { id: ChallengeId },

    /// Stop a running instance
    Stop { id: ChallengeId },

    /// Force-remove an instance
    Kill { id: ChallengeId },

    /// Build the challenge image (admin)
    Build { id: ChallengeId },

    /// Poll instances on an interval and print every change until Ctrl-C
    Watch {
        #[arg(required = true)]
        ids: Vec<ChallengeId>,

        /// Poll period in seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Also listen for backend push events
        #[arg(long)]
        realtime: bool,
    },

    /// Fetch every docker challenge of a collection once, as `id[:type[:name]]`
    Grid {
        #[arg(required = true, value_parser = parse_grid_entry)]
        challenges: Vec<ChallengeSummary>,

        /// Fetch up to N challenges concurrently
        #[arg(long)]
        parallel: Option<usize>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

fn parse_grid_entry(s: &str) -> Result<ChallengeSummary, String> {
    let mut parts = s.splitn(3, ':');
    let id: ChallengeId = parts
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|e: ApiError| e.to_string())?;
    let kind = parts.next().filter(|k| !k.is_empty()).unwrap_or("docker");
    let name = parts.next().unwrap_or_default();
    Ok(ChallengeSummary {
        id,
        name: name.to_string(),
        challenge_type: kind.to_string(),
    })
}

fn grid_line(challenge: &ChallengeSummary, view: &InstanceView) -> String {
    let name = Some(challenge.name.as_str()).filter(|n| !n.is_empty());
    render::row(view, name)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    metrics::register_metrics();

    let cli = Cli::parse();
    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    };

    if cli.metrics {
        print!("{}", metrics::gather_metrics());
    }
    code
}

async fn run(cli: &Cli) -> Result<ExitCode, CliError> {
    let (poll_interval_secs, realtime) = match &cli.command {
        Command::Watch {
            interval, realtime, ..
        } => (*interval, *realtime),
        _ => (None, false),
    };
    let config = Config::load(&Overrides {
        base_url: cli.base_url.clone(),
        token: cli.token.clone(),
        poll_interval_secs,
        realtime,
    })?;
    info!(base_url = %config.base_url, "using backend");

    let api: Arc<dyn InstanceApi> = Arc::new(HttpInstanceClient::from_config(&config)?);
    let store = InstanceStore::new();
    let controller = InstanceController::new(api.clone(), store.clone())
        .with_refetch_delay(config.refetch_delay);

    match &cli.command {
        Command::Status { id } => {
            if let FetchOutcome::Failed(e) = controller.refresh(*id).await {
                return Err(e.into());
            }
            print!("{}", render::detail(&store.view(*id), store.in_flight(), Utc::now()));
            Ok(ExitCode::SUCCESS)
        }
        Command::Start { id } => {
            let mut notices = store.subscribe();
            let ok = controller.start(*id).await.is_ok();
            finish_action(&store, &mut notices, *id, ok)
        }
        Command::Stop { id } => {
            let mut notices = store.subscribe();
            let ok = controller.stop(*id).await.is_ok();
            finish_action(&store, &mut notices, *id, ok)
        }
        Command::Kill { id } => {
            let mut notices = store.subscribe();
            let ok = controller.kill(*id).await.is_ok();
            finish_action(&store, &mut notices, *id, ok)
        }
        Command::Build { id } => {
            let mut notices = store.subscribe();
            let ok = controller.build(*id).await.is_ok();
            print_notices(&mut notices);
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Watch { ids, .. } => {
            watch(&config, api, store, ids.clone()).await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Grid {
            challenges,
            parallel,
        } => {
            let mode = match parallel {
                Some(n) => BatchMode::Parallel {
                    max_concurrency: *n,
                },
                None => BatchMode::Sequential,
            };
            let poller = CollectionPoller::new(api, store.clone()).with_mode(mode);
            if !poller.on_render(challenges) {
                eprintln!("no docker challenges in the collection");
                return Ok(ExitCode::SUCCESS);
            }
            let Some(report) = poller.wait().await else {
                return Ok(ExitCode::FAILURE);
            };

            for challenge in challenges.iter().filter(|c| c.is_docker()) {
                let view = store.view(challenge.id);
                println!("{}", grid_line(challenge, &view));
            }
            eprintln!(
                "fetched {} of {} ({} failed)",
                report.fetched,
                report.requested,
                report.failed.len()
            );
            Ok(if report.failed.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn print_notices(rx: &mut tokio::sync::broadcast::Receiver<StoreEvent>) {
    while let Ok(event) = rx.try_recv() {
        if let StoreEvent::Notice(n) = event {
            println!("{}", render::notice(&n));
        }
    }
}

fn finish_action(
    store: &InstanceStore,
    rx: &mut tokio::sync::broadcast::Receiver<StoreEvent>,
    id: ChallengeId,
    ok: bool,
) -> Result<ExitCode, CliError> {
    print_notices(rx);
    print!("{}", render::detail(&store.view(id), store.in_flight(), Utc::now()));
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn watch(
    config: &Config,
    api: Arc<dyn InstanceApi>,
    store: InstanceStore,
    ids: Vec<ChallengeId>,
) {
    let mut events = store.subscribe();
    let _poller = poller::spawn_interval(api.clone(), store.clone(), ids, config.poll_interval);
    let _realtime = config
        .realtime
        .then(|| RealtimeListener::from_config(config).spawn(api, store));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", render::event(&event)),
                Err(RecvError::Lagged(n)) => warn!("skipped {n} store events"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                info!("interrupted, stopping");
                break;
            }
        }
    }
}
