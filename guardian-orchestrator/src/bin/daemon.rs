//! Guardian daemon binary.
//!
//! `serve` runs the orchestrator behind a control socket. `add-account` and
//! `remove-account` edit the accounts file directly; every other subcommand
//! is a client of the socket.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use guardian_keystore::{AccountEntry, AccountsFile, RemoteSignerConfig};
use guardian_orchestrator::{
    BeaconNodeEndpoint, BeaconServiceFactory, ControlClient, ControlServer, Coordinator, Decision,
    FileEndpointStore, HttpConnector, LifecycleEvent, OrchestratorConfig, PublicKey, Request,
    Response, SlashingProtectionDb, SocketDecisionPrompt,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Validator orchestration daemon with a mandatory slashing protection gate.
#[derive(Parser, Debug)]
#[command(name = "guardian-daemon")]
#[command(about = "Start and stop validators behind a slashing protection gate")]
#[command(version)]
struct Args {
    /// Path to the control socket
    #[arg(long, env = "GUARDIAN_SOCKET", default_value = "/var/run/guardian/control.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator and listen on the control socket
    Serve(ServeArgs),
    /// Start a validator
    Start { public_key: PublicKey },
    /// Stop a validator
    Stop { public_key: PublicKey },
    /// Answer a pending slashing protection prompt
    Decide {
        public_key: PublicKey,
        #[command(subcommand)]
        decision: DecisionArg,
    },
    /// Replace the beacon nodes assigned to a validator
    SetBeaconNode {
        public_key: PublicKey,
        /// Beacon node URLs, first one is used
        #[arg(required = true)]
        urls: Vec<String>,
        /// Container running the first node, if local
        #[arg(long)]
        container_id: Option<String>,
    },
    /// Show orchestration and chain status of a validator
    Status { public_key: PublicKey },
    /// List configured validators
    List,
    /// Export slashing protection history as an interchange file
    Export {
        /// Output file
        #[arg(long)]
        out: PathBuf,
        /// Validators to export (all when omitted)
        public_keys: Vec<PublicKey>,
    },
    /// Check that the daemon is up
    Ping,
    /// Add or replace a validator in the accounts file
    AddAccount {
        #[command(flatten)]
        accounts: AccountsArg,
        public_key: PublicKey,
        /// Network the validator belongs to
        #[arg(long)]
        network: String,
        /// Remote signer socket holding the validator's secret key
        #[arg(long)]
        signer_socket: PathBuf,
        /// Ask the signer for its public key before every start
        #[arg(long)]
        verify_pubkey: bool,
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a validator from the accounts file
    RemoveAccount {
        #[command(flatten)]
        accounts: AccountsArg,
        public_key: PublicKey,
    },
}

#[derive(clap::Args, Debug)]
struct AccountsArg {
    /// Accounts file (validator keys, networks and remote signers)
    #[arg(long = "accounts", env = "GUARDIAN_ACCOUNTS", default_value = "/var/lib/guardian/accounts.json")]
    path: PathBuf,
}

#[derive(Subcommand, Debug)]
enum DecisionArg {
    /// Import an interchange file
    Upload { path: PathBuf },
    /// Start without slashing protection history
    Skip,
    /// Abort the start
    Cancel,
}

impl From<DecisionArg> for Decision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Upload { path } => Decision::Upload(path),
            DecisionArg::Skip => Decision::Skip,
            DecisionArg::Cancel => Decision::Cancel,
        }
    }
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    accounts: AccountsArg,

    /// Beacon node assignments file
    #[arg(long, env = "GUARDIAN_BEACON_NODES", default_value = "/var/lib/guardian/beacon-nodes.json")]
    beacon_nodes: PathBuf,

    /// Slashing protection database
    #[arg(long, env = "GUARDIAN_SLASHING_DB", default_value = "/var/lib/guardian/slashing-protection.json")]
    slashing_db: PathBuf,

    /// Seconds to wait for a beacon node's chain config before using defaults
    #[arg(long, default_value_t = 5)]
    config_timeout_secs: u64,

    /// Beacon node HTTP request timeout in seconds
    #[arg(long, default_value_t = 10)]
    http_timeout_secs: u64,

    #[arg(long, env = "GUARDIAN_GRAFFITI")]
    graffiti: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Serve(serve_args) => serve(args.socket, serve_args).await,
        Command::AddAccount {
            accounts,
            public_key,
            network,
            signer_socket,
            verify_pubkey,
            name,
        } => edit_accounts(&accounts.path, |file| {
            file.upsert(AccountEntry {
                public_key,
                network,
                name,
                remote_signer: RemoteSignerConfig {
                    socket_path: signer_socket,
                    verify_pubkey,
                },
            })?;
            info!("Added {} to {:?}", public_key, file.path());
            Ok(())
        }),
        Command::RemoveAccount {
            accounts,
            public_key,
        } => edit_accounts(&accounts.path, |file| {
            if file.remove(&public_key)? {
                info!("Removed {} from {:?}", public_key, file.path());
            } else {
                warn!("{} is not in {:?}", public_key, file.path());
            }
            Ok(())
        }),
        command => client(ControlClient::new(args.socket), command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn serve(socket: PathBuf, args: ServeArgs) -> Result<(), String> {
    info!("Starting guardian-daemon");
    info!("Socket path: {:?}", socket);
    info!("Accounts file: {:?}", args.accounts.path);
    info!("Beacon nodes file: {:?}", args.beacon_nodes);
    info!("Slashing protection database: {:?}", args.slashing_db);

    let config = OrchestratorConfig {
        config_fetch_timeout: Duration::from_secs(args.config_timeout_secs),
        http_timeout: Duration::from_secs(args.http_timeout_secs),
        graffiti: args.graffiti,
        ..OrchestratorConfig::default()
    };

    let accounts = Arc::new(
        AccountsFile::load(&args.accounts.path)
            .map_err(|e| format!("Failed to load accounts file: {e}"))?,
    );
    let signers = accounts.clone();
    let offline = tokio::task::spawn_blocking(move || signers.check_signers())
        .await
        .map_err(|e| format!("Remote signer check failed: {e}"))?;
    if !offline.is_empty() {
        warn!(
            "{} validator(s) have an unreachable remote signer and will fail to sign until it is up",
            offline.len()
        );
    }
    let endpoints = FileEndpointStore::open(&args.beacon_nodes)
        .map_err(|e| format!("Failed to open beacon node assignments: {e}"))?;
    let slashing = SlashingProtectionDb::open(&args.slashing_db)
        .map_err(|e| format!("Failed to open slashing protection database: {e}"))?;
    let prompt = Arc::new(SocketDecisionPrompt::new());

    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        accounts,
        Arc::new(endpoints),
        Arc::new(HttpConnector::new(config.http_timeout)),
        Arc::new(slashing),
        prompt.clone(),
        Arc::new(BeaconServiceFactory),
    ));

    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::AttestationSigned { .. }) => {}
                Ok(event) => info!(validator = %event.public_key().short(), ?event, "Lifecycle event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Lifecycle event log lagged, {} events skipped", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let server = ControlServer::bind(&socket, coordinator.clone(), prompt)
        .map_err(|e| format!("Failed to create control server: {e}"))?;

    info!("Guardian daemon ready, waiting for connections...");

    let result = tokio::select! {
        result = server.run() => result.map_err(|e| format!("Server error: {e}")),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    coordinator.stop_all().await;
    let _ = std::fs::remove_file(&socket);
    result
}

/// The serving daemon reads the accounts file at startup; edits apply on its next start.
fn edit_accounts(
    path: &Path,
    edit: impl FnOnce(&AccountsFile) -> Result<(), guardian_keystore::AccountError>,
) -> Result<(), String> {
    let file = AccountsFile::load(path).map_err(|e| format!("Failed to load accounts file: {e}"))?;
    edit(&file).map_err(|e| format!("Failed to update accounts file: {e}"))
}

async fn client(client: ControlClient, command: Command) -> Result<(), String> {
    let request = match command {
        Command::Serve(_) | Command::AddAccount { .. } | Command::RemoveAccount { .. } => {
            return Err("not a client command".to_string())
        }
        Command::Start { public_key } => Request::Start { public_key },
        Command::Stop { public_key } => Request::Stop { public_key },
        Command::Decide {
            public_key,
            decision,
        } => Request::Decide {
            public_key,
            decision: decision.into(),
        },
        Command::SetBeaconNode {
            public_key,
            urls,
            container_id,
        } => {
            let mut nodes: Vec<BeaconNodeEndpoint> = urls.into_iter().map(BeaconNodeEndpoint::new).collect();
            if let Some(first) = nodes.first_mut() {
                first.container_id = container_id;
            }
            Request::SetBeaconNodes { public_key, nodes }
        }
        Command::Status { public_key } => Request::Status { public_key },
        Command::List => Request::List,
        Command::Export { out, public_keys } => {
            // The daemon writes the file, so hand it an absolute path.
            let path = if out.is_absolute() {
                out
            } else {
                std::env::current_dir()
                    .map_err(|e| format!("Invalid output path: {e}"))?
                    .join(out)
            };
            Request::Export {
                public_keys,
                path,
            }
        }
        Command::Ping => Request::Ping,
    };

    let response = client
        .request(&request)
        .await
        .map_err(|e| format!("Control request failed: {e}"))?;

    match response {
        Response::Error {
            message,
            cancelled: true,
            ..
        } => {
            info!("{}", message);
            Ok(())
        }
        Response::Error {
            message, retryable, ..
        } => {
            if retryable {
                Err(format!("{message} (retry possible)"))
            } else {
                Err(message)
            }
        }
        Response::Status(report) => {
            println!("validator:          {}", report.public_key);
            println!("state:              {:?}", report.state);
            println!("running:            {}", report.running);
            println!("awaiting decision:  {}", report.awaiting_decision);
            match report.chain_status {
                Some(status) => println!("chain status:       {:?}", status),
                None => println!("chain status:       unavailable"),
            }
            Ok(())
        }
        Response::Validators(list) => {
            for validator in list {
                let pending = if validator.awaiting_decision { " (awaiting decision)" } else { "" };
                println!("{}  {:?}{}", validator.public_key, validator.state, pending);
            }
            Ok(())
        }
        Response::Exported { validators } => {
            println!("exported {validators} validators");
            Ok(())
        }
        other => {
            println!("{:?}", other);
            Ok(())
        }
    }
}
