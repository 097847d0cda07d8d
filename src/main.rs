use std::{path::PathBuf, time::Duration};

use anyhow::Context as _;
use clap::{Args, Parser};
use k8s_openapi::api::{
    core::v1::{Endpoints, Service},
    networking::v1::Ingress,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod k8s;
mod metrics;
mod project;
mod publish;
mod reconciler;
mod state;

/// a bridge from Kubernetes Ingress to an edge load-balancer pool
#[derive(Parser, Debug)]
#[command(version)]
struct CliArgs {
    /// Log in a pretty, human-readable format.
    #[arg(long)]
    log_pretty: bool,

    /// The address to serve prometheus metrics on. Metrics are disabled if
    /// this option is not set.
    #[arg(long)]
    metrics_addr: Option<String>,

    /// The base URL of the load-balancer pool API.
    #[arg(long)]
    lb_addr: String,

    /// Path to a file containing a bearer token for the pool API. Requests
    /// are unauthenticated if this option is not set.
    #[arg(long)]
    lb_token_file: Option<PathBuf>,

    /// The name of the pool this controller owns. The pool is created at
    /// startup if the API doesn't have it yet.
    #[arg(long, default_value = "k8s")]
    pool_name: String,

    /// The port the pool's HTTP frontend binds.
    #[arg(long, default_value_t = 8080)]
    bind_port: u16,

    /// How long to wait for the watch caches to sync at startup before
    /// giving up. Running against an unsynced baseline is never safe, so
    /// hitting this timeout is fatal.
    #[arg(long, default_value_t = 300)]
    cache_sync_timeout_secs: u64,

    #[command(flatten)]
    namespace_args: NamespaceArgs,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
struct NamespaceArgs {
    /// Watch all namespaces. Defaults to false.
    ///
    /// It's an error to set both --all-namespaces and --namespace.
    #[arg(long)]
    all_namespaces: bool,

    /// The namespace to watch. If this option is not set explicitly,
    /// edgebridge will watch the namespace set in the kubeconfig's current
    /// context, the namespace specified by the service account the server is
    /// running as, or the `default` namespace.
    ///
    /// It's an error to set both --all-namespaces and --namespace.
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    setup_tracing(args.log_pretty);

    if let Err(e) = run(args).await {
        tracing::error!(err = ?e, "exiting: {e}");
        std::process::exit(1);
    }
}

fn setup_tracing(log_pretty: bool) {
    let default_log_filter = "edgebridge=info"
        .parse()
        .expect("default log filter must be valid");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_filter)
                .from_env_lossy(),
        )
        .with_target(true);

    if log_pretty {
        // don't use .pretty(), it's too pretty
        builder.init();
    } else {
        builder
            .json()
            .flatten_event(true)
            .with_span_list(false)
            .init();
    }
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    if let Some(addr) = &args.metrics_addr {
        metrics::install_prom(addr)?;
    }

    let client = kube::Client::try_default().await?;

    let token = match &args.lb_token_file {
        Some(path) => {
            let token = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read token file: {}", path.display()))?;
            Some(token.trim().to_string())
        }
        None => None,
    };

    let pool_client = publish::PoolClient::new(&args.lb_addr, args.pool_name.clone(), token)?;
    pool_client
        .ping()
        .await
        .context("load-balancer api is unreachable")?;
    pool_client.ensure_pool(args.bind_port).await?;
    info!(pool = args.pool_name, "load-balancer backend ready");

    let (publish_tx, publish_rx) = mpsc::unbounded_channel();
    tokio::spawn(publish::Publisher::new(publish_rx, pool_client, args.bind_port).run());

    let all_namespaces = args.namespace_args.all_namespaces;
    let namespace = args.namespace_args.namespace.as_deref();

    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (ingress_store, run_ingresses) = k8s::watch::<Ingress>(
        kube_api(&client, all_namespaces, namespace),
        msg_tx.clone(),
    );
    let (service_store, run_services) = k8s::watch::<Service>(
        kube_api(&client, all_namespaces, namespace),
        msg_tx.clone(),
    );
    let (endpoints_store, run_endpoints) = k8s::watch::<Endpoints>(
        kube_api(&client, all_namespaces, namespace),
        msg_tx.clone(),
    );

    let reconciler =
        reconciler::Reconciler::new(msg_rx, msg_tx, endpoints_store.clone(), publish_tx);

    let ingress_watch = tokio::spawn(run_ingresses);
    let service_watch = tokio::spawn(run_services);
    let endpoints_watch = tokio::spawn(run_endpoints);

    // the baseline must come from synced caches; anything else converges to
    // a stale snapshot and deletes routes that still exist.
    let caches_ready = async {
        ingress_store.wait_until_ready().await?;
        service_store.wait_until_ready().await?;
        endpoints_store.wait_until_ready().await?;
        Ok::<_, kube::runtime::reflector::store::WriterDropped>(())
    };
    tokio::time::timeout(
        Duration::from_secs(args.cache_sync_timeout_secs),
        caches_ready,
    )
    .await
    .context("timed out waiting for watch caches to sync")??;
    info!("watch caches synced");

    tokio::spawn(reconciler.run(ingress_store));

    tokio::try_join!(
        join_watch(ingress_watch),
        join_watch(service_watch),
        join_watch(endpoints_watch),
    )?;

    Ok(())
}

fn kube_api<K>(client: &kube::Client, all_namespaces: bool, namespace: Option<&str>) -> kube::Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match (all_namespaces, namespace) {
        (true, _) => kube::Api::all(client.clone()),
        (_, Some(namespace)) => kube::Api::namespaced(client.clone(), namespace),
        _ => kube::Api::default_namespaced(client.clone()),
    }
}

async fn join_watch<E>(handle: JoinHandle<Result<(), E>>) -> anyhow::Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}
