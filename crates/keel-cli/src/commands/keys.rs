use keel_client::{Client, ClientConfig, Lookup};
use serde_json::{json, Value};

use super::{change_json, change_line};
use crate::OutputFormat;

pub async fn get(config: ClientConfig, key: &str, format: OutputFormat) -> anyhow::Result<()> {
    let client = Client::connect(config).await?;
    let Some(found) = client.get(key).await? else {
        anyhow::bail!("key not found: {key}");
    };

    match (format, found) {
        (OutputFormat::Json, Lookup::Value(value)) => println!("{}", json!(value)),
        (OutputFormat::Json, Lookup::Listing(children)) => {
            println!("{}", serde_json::to_string_pretty(&children)?)
        }
        (OutputFormat::Text, Lookup::Value(value)) => println!("{value}"),
        (OutputFormat::Text, Lookup::Listing(children)) => {
            for (child, value) in children {
                println!("{child} = {value}");
            }
        }
    }
    Ok(())
}

pub async fn set(
    config: ClientConfig,
    key: &str,
    value: &str,
    ttl: Option<u64>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let client = Client::connect(config).await?;
    let previous = client.set(key, value, ttl).await?;

    match format {
        OutputFormat::Json => println!("{}", json!({ "key": key, "value": value, "prevValue": previous })),
        OutputFormat::Text => match previous {
            Some(prev) => println!("{key} = {value} (was {prev})"),
            None => println!("{key} = {value}"),
        },
    }
    Ok(())
}

pub async fn update(
    config: ClientConfig,
    key: &str,
    value: &str,
    prev: &str,
    ttl: Option<u64>,
) -> anyhow::Result<()> {
    let client = Client::connect(config).await?;
    if !client.update(key, value, prev, ttl).await? {
        anyhow::bail!("{key} does not hold {prev:?}");
    }
    println!("{key} = {value}");
    Ok(())
}

pub async fn delete(config: ClientConfig, key: &str, format: OutputFormat) -> anyhow::Result<()> {
    let client = Client::connect(config).await?;
    let Some(previous) = client.delete(key).await? else {
        anyhow::bail!("key not found: {key}");
    };

    match format {
        OutputFormat::Json => println!("{}", json!({ "key": key, "prevValue": previous })),
        OutputFormat::Text => println!("deleted {key} (was {previous})"),
    }
    Ok(())
}

pub async fn info(config: ClientConfig, key: &str, format: OutputFormat) -> anyhow::Result<()> {
    let client = Client::connect(config).await?;
    let Some(found) = client.info(key).await? else {
        anyhow::bail!("key not found: {key}");
    };

    match (format, found) {
        (OutputFormat::Json, Lookup::Value(info)) => {
            println!("{}", serde_json::to_string_pretty(&change_json(&info))?)
        }
        (OutputFormat::Json, Lookup::Listing(children)) => {
            let map: serde_json::Map<String, Value> = children
                .iter()
                .map(|(k, info)| (k.clone(), change_json(info)))
                .collect();
            println!("{}", serde_json::to_string_pretty(&map)?);
        }
        (OutputFormat::Text, Lookup::Value(info)) => {
            println!("{}", change_line(&info));
            if let (Some(ttl), Some(expiration)) = (info.ttl, info.expiration) {
                println!("  ttl {ttl}s, expires {}", expiration.to_rfc3339());
            }
        }
        (OutputFormat::Text, Lookup::Listing(children)) => {
            for info in children.values() {
                println!("{}", change_line(info));
            }
        }
    }
    Ok(())
}
