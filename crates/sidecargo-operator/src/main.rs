use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use sidecargo_engine::{TemplateRegistry, crd::SidecarGo};
use sidecargo_operator::{
    APP_NAME,
    cli::{Command, Opts, RunArguments},
    controller, logging,
    webhook::{self, WebhookContext},
};
use sidecargo_webhook::{WebhookServer, WebhookServerError, webhooks::MutatingWebhookError};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::oneshot;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to print CRD"))]
    PrintCrd { source: serde_yaml::Error },

    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::LoggingError },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("SidecarGo watcher stopped before the initial list completed"))]
    WatcherNotReady,

    #[snafu(display("SidecarGo watcher stopped unexpectedly"))]
    WatcherStopped,

    #[snafu(display("failed to create mutating webhook"))]
    CreateWebhook { source: MutatingWebhookError },

    #[snafu(display("failed to create webhook server"))]
    CreateWebhookServer { source: WebhookServerError },

    #[snafu(display("failed to run webhook server"))]
    RunWebhookServer { source: WebhookServerError },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();

    match opts.command {
        Command::Crd => {
            serde_yaml::to_writer(std::io::stdout().lock(), &SidecarGo::crd())
                .context(PrintCrdSnafu)?;
        }
        Command::Run(arguments) => run(arguments).await?,
    }

    Ok(())
}

async fn run(arguments: RunArguments) -> Result<(), Error> {
    logging::initialize_logging(APP_NAME, arguments.log_directory.as_deref())
        .context(InitializeLoggingSnafu)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting {APP_NAME}");

    let client = Client::try_default().await.context(CreateClientSnafu)?;
    let registry = Arc::new(TemplateRegistry::new());

    let (ready_tx, ready_rx) = oneshot::channel();
    let watcher = tokio::spawn(controller::run(
        client.clone(),
        arguments.watch_namespace,
        registry.clone(),
        ready_tx,
    ));

    // Only admit Pods once all templates present in the cluster are known
    ready_rx.await.ok().context(WatcherNotReadySnafu)?;

    let ctx = Arc::new(WebhookContext::new(registry));
    let webhook =
        webhook::create_webhook(ctx, client, &arguments.webhook).context(CreateWebhookSnafu)?;
    let server = WebhookServer::new(vec![webhook], arguments.webhook.server_options())
        .await
        .context(CreateWebhookServerSnafu)?;

    tokio::select! {
        result = server.run() => result.context(RunWebhookServerSnafu),
        _ = watcher => WatcherStoppedSnafu.fail(),
    }
}
