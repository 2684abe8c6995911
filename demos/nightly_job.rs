//! Nightly tile refresh driven by alf-run
//!
//! Downloads every URL in `NIGHTLY_URLS` (comma separated) into
//! `NIGHTLY_DATA`, two at a time, retrying transient failures. Stale
//! sources raise a caution flag; any other failure fails the run.
//!
//! Usage: NIGHTLY_URLS=https://example.com/a.tif,https://example.com/b.tif \
//!        cargo run --example nightly_job

use alf_run::download::{DownloadRequest, Downloader, Freshness};
use alf_run::{DownloadConfig, DownloadOutcome, Error, RetryConfig, RunOptions, WaitOptions, retry_transient, run};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let home = std::env::var("NIGHTLY_HOME").unwrap_or_else(|_| "logs".to_string());
    let mut options = RunOptions::new("nightly_tiles", home);
    options.singleton = true;

    run(options, |logger| async move {
        let urls: Vec<String> = std::env::var("NIGHTLY_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();
        if urls.is_empty() {
            return Err(Error::exit(0, Some("nothing to download".to_string())));
        }
        let data = PathBuf::from(std::env::var("NIGHTLY_DATA").unwrap_or_else(|_| "data".to_string()));
        let downloader = Arc::new(Downloader::new(DownloadConfig::default())?);
        let retry = RetryConfig::fixed(3, Duration::from_secs(30));

        let pool = logger.create_worker_pool("tiles", 2.0, None)?;
        let mut tickets = Vec::new();
        for url in urls {
            let name = url.rsplit('/').next().unwrap_or("download").to_string();
            let request = DownloadRequest::new(url, data.join(&name))
                .freshness(Freshness::MaxAge(Duration::from_secs(3 * 86_400)));
            let downloader = downloader.clone();
            let retry = retry.clone();
            tickets.push(pool.submit(move |ctx| async move {
                let outcome =
                    retry_transient(&retry, || downloader.get_download(&request)).await?;
                ctx.log(&format!("{}: {outcome:?}", request.url));
                Ok(outcome)
            })?);
        }

        logger.wait_for_workers(WaitOptions::default()).await?;
        let mut updated = 0;
        for ticket in tickets {
            match ticket.result().await {
                Ok(DownloadOutcome::Updated { .. }) => updated += 1,
                Ok(DownloadOutcome::Fresh) => {}
                Ok(DownloadOutcome::Stale { modified }) => {
                    logger.set_flag(format!("a source has not changed since {modified}"));
                }
                Err(e) => logger.set_error(e.to_string()),
            }
        }
        logger.archive(&format!("{updated} tiles updated"), true)?;
        Ok(())
    })
    .await
}
