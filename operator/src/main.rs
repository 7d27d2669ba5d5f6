use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;

use hibernator_operator::{exceptions, plans, util, webhook};

/// Runs the Plan and Exception controllers plus the admission webhook in one
/// process. Each can be disabled independently for local development.
#[derive(Parser, Debug, Clone)]
struct Args {
    /// Container image used for Job-based shutdown/wakeup workers.
    #[arg(long, env = "WORKER_IMAGE", default_value = "hibernator-worker:latest")]
    worker_image: String,

    /// Port the validating admission webhook listens on.
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 8443)]
    webhook_port: u16,

    /// Disable the admission webhook server, e.g. for a dev cluster with no
    /// ValidatingWebhookConfiguration installed.
    #[arg(long, env = "DISABLE_WEBHOOK")]
    disable_webhook: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    hibernator_common::init();

    let args = Args::parse();

    #[cfg(feature = "metrics")]
    util::metrics::maybe_spawn_metrics_server();

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client from in-cluster or kubeconfig context")?;

    let mut plans_join = Box::pin(tokio::spawn(plans::run(client.clone(), args.worker_image.clone())));
    let mut exceptions_join = Box::pin(tokio::spawn(exceptions::run(client.clone())));

    if args.disable_webhook {
        let res = plans_join
            .as_mut()
            .await
            .context("Plan controller task panicked")?;
        res.context("Plan controller failed")?;
        let res = exceptions_join
            .as_mut()
            .await
            .context("Exception controller task panicked")?;
        res.context("Exception controller failed")?;
        return Ok(());
    }

    let mut webhook_join = Box::pin(tokio::spawn(webhook::run(client, args.webhook_port)));

    tokio::select! {
        res = &mut plans_join => {
            exceptions_join.abort();
            webhook_join.abort();
            res.context("Plan controller task panicked")?.context("Plan controller failed")?;
        }
        res = &mut exceptions_join => {
            plans_join.abort();
            webhook_join.abort();
            res.context("Exception controller task panicked")?.context("Exception controller failed")?;
        }
        res = &mut webhook_join => {
            plans_join.abort();
            exceptions_join.abort();
            res.context("Webhook server task panicked")?.context("Webhook server failed")?;
        }
    }

    println!("{}", "🛑 Hibernator operator shut down gracefully.".red());
    Ok(())
}
