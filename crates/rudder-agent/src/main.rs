//! rudder-agent binary

use clap::Parser;
use kube::{Api, Client};
use rudder_agent::{
    AgentOptions, ChartRelease, ClusterDesiredState, Dispatcher, Executor, LogFormat, LogReporter,
    Reconciler, Result, channels, controller, reporter,
};
use rudder_engine::YamlLabeler;
use rudder_kube::{KubeCluster, Namespaces, ReleaseClient, SecretsDriver};
use rudder_repo::HttpChartSource;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    miette::set_panic_hook();

    let options = AgentOptions::parse();
    init_tracing(options.log_format);

    run(options).await?;
    Ok(())
}

async fn run(options: AgentOptions) -> Result<()> {
    let client = Client::try_default().await?;

    let namespaces = Namespaces::new();
    let api: Api<ChartRelease> = match &options.namespace {
        Some(namespace) => {
            namespaces.add(namespace);
            Api::namespaced(client.clone(), namespace)
        }
        None => Api::all(client.clone()),
    };
    if let Err(e) = controller::track_namespaces(&api, &namespaces).await {
        tracing::warn!(error = %e, "failed to list ChartRelease namespaces");
    }

    let storage = SecretsDriver::with_client(client.clone(), options.storage_config());
    let cluster = KubeCluster::new(client.clone()).await?;
    let charts = HttpChartSource::new()?;
    let releases = Arc::new(
        ReleaseClient::new(
            storage,
            Arc::new(charts),
            Arc::new(cluster),
            options.engine_config(),
        )
        .with_labeler(Arc::new(YamlLabeler::new()))
        .with_namespaces(namespaces.clone()),
    );

    if let Some(url) = &options.connect_url {
        match releases.list_agent(url).await {
            Ok((upgrade, cert_manager)) => tracing::info!(
                legacy_envs = upgrade.envs.len(),
                cert_manager = ?cert_manager,
                "agent inventory"
            ),
            Err(e) => tracing::warn!(error = %e, "agent inventory failed"),
        }
    }

    let (outbox, inbox) = channels(options.command_capacity, options.response_capacity);
    let mut tasks = JoinSet::new();

    let executor = Executor::new(releases.clone(), outbox.clone());
    let commands = inbox.commands;
    tasks.spawn(async move {
        if let Err(e) = executor.run(commands).await {
            tracing::error!(error = %e, "executor stopped");
        }
    });

    let responses = inbox.responses;
    tasks.spawn(async move { reporter::drain(&LogReporter, responses).await });

    let reconciler = Arc::new(
        Reconciler::new(
            Arc::new(ClusterDesiredState::new(client)),
            releases,
            outbox,
        )
        .with_query_timeout(options.query_timeout()),
    );
    let dispatcher = Dispatcher::spawn(
        reconciler,
        options.workers,
        options.requeue_delay(),
        &mut tasks,
    );

    tracing::info!(
        namespace = options.namespace.as_deref().unwrap_or("*"),
        workers = options.workers,
        "rudder-agent started"
    );

    tokio::select! {
        result = controller::run(api, dispatcher, namespaces) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
    }

    tasks.abort_all();
    Ok(())
}
