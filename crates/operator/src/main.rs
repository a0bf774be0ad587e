use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tracing::{error, info, warn};

use coral_core::Outcome;
use coral_kubehub::KubeHub;
use coral_model::Component;
use coral_reconcile::Reconciler;

#[derive(Parser, Debug)]
#[command(name = "coral-operator", version, about = "Coral component operator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the component controller
    Run {
        /// Namespace holding the operator ConfigMap
        #[arg(
            long = "operator-namespace",
            env = "CORAL_OPERATOR_NAMESPACE",
            default_value = "coral-system"
        )]
        operator_namespace: String,
        /// Watch a single namespace instead of the whole cluster
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
    /// Print the Component CRD manifest
    Crd,
}

fn init_tracing() {
    let env = std::env::var("CORAL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CORAL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CORAL_METRICS_ADDR; expected host:port");
        }
    }
}

struct Ctx {
    reconciler: Reconciler,
}

async fn reconcile(
    comp: Arc<Component>,
    ctx: Arc<Ctx>,
) -> std::result::Result<Action, coral_core::Error> {
    let ns = comp.namespace().unwrap_or_default();
    let name = comp.name_any();
    match ctx.reconciler.reconcile(&ns, &name).await? {
        Outcome::Done => Ok(Action::await_change()),
        Outcome::Requeue(delay) => Ok(Action::requeue(delay)),
    }
}

fn error_policy(comp: Arc<Component>, err: &coral_core::Error, _ctx: Arc<Ctx>) -> Action {
    warn!(name = %comp.name_any(), error = %err, "reconcile errored before classification, requeueing");
    Action::requeue(Duration::from_secs(1))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Crd => {
            println!("{}", serde_yaml::to_string(&Component::crd())?);
        }
        Commands::Run {
            operator_namespace,
            namespace,
        } => {
            let client = Client::try_default().await?;
            let hub = Arc::new(KubeHub::new(client.clone()));
            let ctx = Arc::new(Ctx {
                reconciler: Reconciler::new(hub, operator_namespace),
            });
            let components: Api<Component> = match &namespace {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            };
            info!(watch = namespace.as_deref().unwrap_or("<cluster>"), "starting component controller");
            Controller::new(components, watcher::Config::default())
                .shutdown_on_signal()
                .run(reconcile, error_policy, ctx)
                .for_each(|result| async move {
                    match result {
                        Ok((obj, _)) => info!(object = %obj.name, "reconciled"),
                        Err(e) => error!(error = %e, "controller error"),
                    }
                })
                .await;
            info!("controller stopped");
        }
    }
    Ok(())
}
