use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use skiff_deploy::{deploy, info as describe, remove, DeployOptions};
use skiff_kubehub::KubeCluster;
use tracing::{error, info};

mod config;

use config::ServiceConfig;

#[derive(Parser, Debug)]
#[command(name = "skiffctl", version, about = "Deploy kubeless functions of a service")]
struct Cli {
    /// Service description file
    #[arg(short = 'c', long = "config", global = true, default_value = "skiff.yaml", env = "SKIFF_CONFIG")]
    config: PathBuf,

    /// Namespace for functions that do not name one (overrides the provider setting)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Log pod status changes at info level
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy every function of the service, then its routing
    Deploy {
        /// Overwrite functions whose live definition differs
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
        /// Host for http events without their own hostname
        #[arg(long = "hostname")]
        hostname: Option<String>,
    },
    /// Redeploy a single function, overwriting it
    DeployFunction {
        name: String,
        #[arg(long = "hostname")]
        hostname: Option<String>,
    },
    /// Remove every function of the service and its routing
    Remove,
    /// Describe the live functions of the service
    Info,
}

fn init_tracing() {
    let env = std::env::var("SKIFF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SKIFF_METRICS_ADDR; expected host:port");
        }
    }
}

fn options(cfg: &ServiceConfig, cli: &Cli, force: bool, hostname: Option<String>) -> DeployOptions {
    let mut opts = DeployOptions::new(&cfg.service);
    opts.defaults = cfg.provider.defaults.clone();
    if let Some(ns) = &cli.namespace {
        opts.defaults.namespace = ns.clone();
    }
    opts.force = force;
    opts.verbose = cli.verbose;
    opts.ingress = cfg.ingress_options();
    if hostname.is_some() {
        opts.ingress.hostname = hostname;
    }
    opts
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = ServiceConfig::load(&cli.config)?;
    info!(service = %cfg.service, functions = cfg.functions.len(), "loaded service description");

    let (functions, opts) = match &cli.command {
        Commands::Deploy { force, hostname } => (cfg.functions.clone(), options(&cfg, &cli, *force, hostname.clone())),
        Commands::DeployFunction { name, hostname } => (cfg.only(name)?, options(&cfg, &cli, true, hostname.clone())),
        Commands::Remove => {
            let cluster = KubeCluster::connect().await.context("connecting to the cluster")?;
            let ns = cli.namespace.clone().unwrap_or_else(|| cfg.provider.defaults.namespace.clone());
            let report = remove(&cluster, &cfg.service, &cfg.functions, &ns).await;
            println!("removed {} function(s), {} already absent", report.removed, report.missing);
            if let Err(e) = report.into_result() {
                error!("removal finished with errors");
                eprintln!("{}", e);
                std::process::exit(1);
            }
            return Ok(());
        }
        Commands::Info => {
            let cluster = KubeCluster::connect().await.context("connecting to the cluster")?;
            let ns = cli.namespace.clone().unwrap_or_else(|| cfg.provider.defaults.namespace.clone());
            let report = describe(&cluster, &cfg.service, &cfg.functions, &ns).await?;
            print!("{}", report.render(cli.verbose));
            return Ok(());
        }
    };

    let cluster = KubeCluster::connect().await.context("connecting to the cluster")?;
    let report = deploy(&cluster, &functions, &opts).await;
    let s = &report.summary;
    println!(
        "created: {}  updated: {}  skipped: {}  conflicts: {}  without handler: {}  ingress documents: {}",
        s.created, s.updated, s.skipped, s.conflicts, s.no_handler, report.ingress_documents
    );
    if let Err(e) = report.into_result() {
        error!("deployment finished with errors");
        eprintln!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const DESC: &str = "service: svc\nprovider:\n  namespace: team\n  hostname: a.example.com\nfunctions:\n  f:\n    handler: h.f\n";

    #[test]
    fn subcommands_parse() {
        let cli = Cli::parse_from(["skiffctl", "--ns", "prod", "deploy-function", "hello"]);
        assert_eq!(cli.namespace.as_deref(), Some("prod"));
        assert!(matches!(cli.command, Commands::DeployFunction { ref name, .. } if name == "hello"));
        let cli = Cli::parse_from(["skiffctl", "deploy", "--force", "-c", "svc.yaml"]);
        assert_eq!(cli.config, PathBuf::from("svc.yaml"));
        assert!(matches!(cli.command, Commands::Deploy { force: true, .. }));
        let cli = Cli::parse_from(["skiffctl", "-v", "info"]);
        assert!(cli.verbose && matches!(cli.command, Commands::Info));
    }

    #[test]
    fn flags_override_the_description() {
        let cfg = ServiceConfig::parse(DESC, Path::new(".")).unwrap();
        let cli = Cli::parse_from(["skiffctl", "--ns", "prod", "-v", "deploy"]);
        let opts = options(&cfg, &cli, false, Some("b.example.com".into()));
        assert_eq!(opts.service, "svc");
        assert_eq!(opts.defaults.namespace, "prod");
        assert!(opts.verbose && !opts.force);
        assert_eq!(opts.ingress.hostname.as_deref(), Some("b.example.com"));

        let cli = Cli::parse_from(["skiffctl", "deploy"]);
        let opts = options(&cfg, &cli, true, None);
        assert_eq!(opts.defaults.namespace, "team");
        assert_eq!(opts.ingress.hostname.as_deref(), Some("a.example.com"));
    }
}
