use std::future::Future;
use std::time::Duration;

use keel_client::{ChangeInfo, Client, ClientConfig, ClientResult};
use tracing::{debug, info};

use super::{change_json, change_line};
use crate::OutputFormat;

fn print_change(change: &ChangeInfo, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", change_json(change)),
        OutputFormat::Text => println!("{}", change_line(change)),
    }
}

pub async fn watch(
    config: ClientConfig,
    prefix: &str,
    index: Option<u64>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let retry_delay = config.watch_retry_delay();
    let client = Client::connect(config).await?;
    let change = next_change(|| client.watch(prefix, index), retry_delay).await?;
    print_change(&change, format);
    Ok(())
}

/// Poll until a change arrives. A long-poll can end without a change, or
/// be refused; each empty answer is followed by `retry_delay`.
async fn next_change<F, Fut>(mut poll: F, retry_delay: Duration) -> ClientResult<ChangeInfo>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<Option<ChangeInfo>>>,
{
    loop {
        if let Some(change) = poll().await? {
            return Ok(change);
        }
        debug!(delay_ms = retry_delay.as_millis() as u64, "watch returned no change, retrying");
        tokio::time::sleep(retry_delay).await;
    }
}

pub async fn observe(config: ClientConfig, prefix: &str, format: OutputFormat) -> anyhow::Result<()> {
    let client = Client::connect(config).await?;
    let session = client
        .observe(prefix, move |change| print_change(change, format))
        .await;
    info!(prefix = %session.prefix(), "observing, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    client.shutdown().await;
    session.join().await;
    Ok(())
}
