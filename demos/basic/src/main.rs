use std::time::Duration;

use chrono::Utc;
use cronwarden::prelude::*;
use serde_json::json;

const DEMO_DURATION_SECS: &str = "DEMO_DURATION_SECS";

async fn refresh_rates(ctx: JobContext) -> HandlerResult {
    let currency = ctx.params["currency"].as_str().unwrap_or("EUR").to_owned();
    tracing::info!(job = %ctx.job_name, attempt = ctx.attempt, "Refreshing {currency} rates");
    Ok(json!({ "currency": currency, "refreshedAt": Utc::now() }))
}

async fn flaky_export(ctx: JobContext) -> HandlerResult {
    if ctx.attempt < 2 {
        return Err(format!("export backend unavailable on attempt {}", ctx.attempt).into());
    }
    Ok(json!({ "exported": 128 }))
}

async fn slow_report(ctx: JobContext) -> HandlerResult {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(json!({ "rows": 10 })),
        _ = ctx.cancellation.cancelled() => Err("report cancelled".into()),
    }
}

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let duration = std::env::var(DEMO_DURATION_SECS)
        .ok()
        .and_then(|secs| secs.parse().ok())
        .unwrap_or(5);
    let config = SchedulerConfig::from_env()
        .unwrap_or_else(|error| {
            tracing::warn!(%error, "Ignoring invalid scheduler configuration: {error}");
            SchedulerConfig::default()
        })
        .with_check_interval(Duration::from_secs(1))
        .with_retry_backoff(Backoff::exponential().with_max(chrono::TimeDelta::seconds(5)));

    let registry = TargetRegistry::new()
        .with_handler("rates", "refresh", refresh_rates)
        .with_handler("exports", "nightly", flaky_export)
        .with_handler("reports", "slow", slow_report);

    let scheduler = Scheduler::new(InMemoryRepository::new(), registry, config);
    let control = JobControl::new(scheduler);

    let rates = control
        .create_job(
            NewJob::new("refresh rates", TargetRef::new("rates", "refresh"), "* * * * *")
                .with_params(json!({ "currency": "GBP" }))
                .with_created_by("demo"),
        )
        .await
        .unwrap();
    let export = control
        .create_job(
            NewJob::new("nightly export", TargetRef::new("exports", "nightly"), "0 2 * * *")
                .with_max_retries(2)
                .with_retry_delay_seconds(1),
        )
        .await
        .unwrap();
    let report = control
        .create_job(
            NewJob::new("slow report", TargetRef::new("reports", "slow"), "0 6 * * 1-5")
                .with_timeout_seconds(1),
        )
        .await
        .unwrap();
    for job in [&rates, &export, &report] {
        println!(
            "Created {} '{}' ({}), next run at {:?}",
            job.id,
            job.name,
            cronwarden::schedule::describe(&job.schedule),
            job.next_run_at
        );
    }

    control.start().await.unwrap();

    let result = control.run_now(export.id).await.unwrap();
    println!("Export finished: {result:?}");
    let result = control.run_now(report.id).await.unwrap();
    println!("Report finished: {result:?}");

    tokio::time::sleep(Duration::from_secs(duration)).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&control.status()).unwrap()
    );
    for job in control.list_jobs().await.unwrap() {
        println!(
            "{} '{}': {} (runs: {}, succeeded: {}, failed: {})",
            job.id,
            job.name,
            job.last_run_status,
            job.run_count,
            job.success_count,
            job.error_count
        );
    }

    control.stop().await;
}
