use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use fleet::config::FleetToml;
use fleet::hub::gateway::{ProviderStatus, RemoteAgentClient, wait_for_completion};

fn spinner(external_id: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string"),
    );
    pb.set_prefix(external_id.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Poll the provider until the task reaches a terminal status.
pub async fn cmd_task_wait(
    settings: &FleetToml,
    external_id: &str,
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let client = RemoteAgentClient::new(
        settings.provider.base_url.clone(),
        settings.api_key(),
        settings.request_timeout(),
    )
    .context("Failed to build provider client")?;

    let interval = interval_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| settings.poll_interval());
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| settings.wait_timeout());

    let pb = spinner(external_id);
    let result = wait_for_completion(&client, external_id, interval, timeout, |task| {
        let progress = task
            .progress
            .map(|p| format!(" {}%", p))
            .unwrap_or_default();
        pb.set_message(format!("{:?}{}", task.status, progress));
    })
    .await;
    pb.finish_and_clear();

    let task = result.with_context(|| format!("Waiting for task {} failed", external_id))?;
    println!("Task {}: {:?}", task.id, task.status);
    if let Some(pr_url) = &task.pr_url {
        println!("  PR: {}", pr_url);
    }
    if let Some(branch) = &task.branch_name {
        println!("  Branch: {}", branch);
    }
    if task.status == ProviderStatus::Failed {
        anyhow::bail!(
            "Task failed: {}",
            task.error.as_deref().unwrap_or("no error reported")
        );
    }
    Ok(())
}
