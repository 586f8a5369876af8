mod bootstrap;
mod config;
mod engine;
mod error;
mod handlers;
mod health;
mod kind;
mod metrics;
mod namespace;
mod podspec;
mod policy;
mod server;
mod tls;
mod transform;
mod version;

use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use clap::{ArgAction, Parser, Subcommand};
use prometheus_client::registry::Registry;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::bootstrap::BootstrapOperation;
use crate::config::{InjectFlags, PolicyConfig, ServerFlags, WebhookConfig, WebhookPolicyFlags};
use crate::namespace::KubeNamespaces;
use crate::transform::{arguments_to_inputs, Transformer};

#[derive(Parser)]
#[command(name = "k8tz", version, about = "Inject timezones into kubernetes pods")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inject timezone into Pods, Deployments, StatefulSets, CronJobs and Lists
    #[command(visible_alias = "i")]
    Inject {
        /// Path to a YAML configuration file
        #[arg(long, env = "K8TZ_CONFIG")]
        config: Option<String>,

        #[command(flatten)]
        flags: InjectFlags,

        /// Files, http(s) URLs or `-` for stdin
        #[arg(default_value = "-")]
        inputs: Vec<String>,
    },

    /// Run the mutating admission webhook server
    Webhook {
        /// Path to a YAML configuration file
        #[arg(long, env = "K8TZ_CONFIG")]
        config: Option<String>,

        #[command(flatten)]
        server: ServerFlags,

        #[command(flatten)]
        policy: WebhookPolicyFlags,

        /// Enable debug logging
        #[arg(long)]
        verbose: bool,
    },

    /// Bootstraps a zoneinfo directory with TZif files from a source directory
    #[command(hide = true)]
    Bootstrap {
        /// Path to directory where to take the files from
        #[arg(short, long, default_value = config::DEFAULT_HOST_PATH_PREFIX)]
        from: PathBuf,

        /// Path to directory where to copy the files to
        #[arg(short, long, default_value = podspec::BOOTSTRAP_MOUNT_PATH)]
        to: PathBuf,

        /// Overwrite files that already exist in the target directory
        #[arg(
            short,
            long,
            action = ArgAction::Set,
            num_args = 0..=1,
            default_value_t = true,
            default_missing_value = "true"
        )]
        overwrite: bool,

        /// Print more verbose logs for debugging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the version
    Version,
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

/// Human-readable logs on stderr, stdout carries command output.
fn init_cli_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter(verbose))
        .init();
}

async fn run_inject(config_path: Option<&str>, flags: &InjectFlags, args: &[String]) -> Result<(), String> {
    let config = PolicyConfig::load(config_path, flags).map_err(|e| format!("failed to load config: {e}"))?;
    let inputs = arguments_to_inputs(args).map_err(|e| e.to_string())?;

    let stdout = std::io::stdout();
    let mut output = BufWriter::new(stdout.lock());
    let result = Transformer::new(config).transform(inputs, &mut output).await;
    output.flush().map_err(|e| e.to_string())?;
    result.map_err(|e| e.to_string())
}

async fn run_webhook(config: WebhookConfig) -> Result<(), String> {
    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        timezone = %config.policy.timezone,
        strategy = %config.policy.strategy,
        inject_by_default = config.policy.inject_by_default,
        init_container_image = %config.policy.init_container_image,
        cron_job_time_zone = config.policy.cron_job_time_zone,
        "k8tz webhook starting"
    );

    let tls_config = tls::load_tls_config(&config.tls_cert_path, &config.tls_key_path)
        .map_err(|e| format!("failed to load TLS config: {e}"))?;
    let tls_acceptor = TlsAcceptor::from(tls_config);

    let namespaces = KubeNamespaces::connect(config.kube_config.as_deref())
        .await
        .map_err(|e| e.to_string())?;

    let mut registry = Registry::default();
    let k8tz_metrics = metrics::K8tzMetrics::new(&mut registry);

    let app_state = Arc::new(handlers::AppState {
        config: config.policy,
        namespaces,
        metrics: k8tz_metrics,
    });

    let webhook_router = Router::new()
        .route("/", post(handlers::handle_mutate::<KubeNamespaces>))
        .route("/mutate", post(handlers::handle_mutate::<KubeNamespaces>))
        .route("/health", get(health::liveness))
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .with_state(app_state);

    let readiness = health::Readiness::default();
    let probe_router = health::router(registry, readiness.clone());

    let webhook_listener = server::bind(&config.listen_addr, "HTTPS webhook").await?;
    let probe_listener = server::bind(&config.metrics_addr, "HTTP metrics/health").await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server::forward_shutdown(shutdown_tx));

    tokio::join!(
        server::serve_tls(webhook_listener, tls_acceptor, webhook_router, readiness, shutdown_rx.clone()),
        server::serve_http(probe_listener, probe_router, shutdown_rx),
    );

    info!("k8tz webhook shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Inject { config, flags, inputs } => {
            init_cli_logging(false);
            run_inject(config.as_deref(), &flags, &inputs).await
        }
        Command::Webhook {
            config,
            server,
            policy,
            verbose,
        } => {
            // Only fails when a provider is already installed.
            let _ = rustls::crypto::ring::default_provider().install_default();

            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter(verbose))
                .init();

            match WebhookConfig::load(config.as_deref(), &server, &policy) {
                Ok(config) => run_webhook(config).await,
                Err(e) => Err(format!("failed to load config: {e}")),
            }
        }
        Command::Bootstrap {
            from,
            to,
            overwrite,
            verbose,
        } => {
            init_cli_logging(verbose);
            BootstrapOperation { from, to, overwrite }
                .run()
                .map_err(|e| e.to_string())
        }
        Command::Version => {
            println!("{}", version::display_version());
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
