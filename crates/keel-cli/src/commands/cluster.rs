use keel_client::{Client, ClientConfig, Node};
use serde_json::{json, Value};

use crate::OutputFormat;

fn node_json(node: &Node) -> Value {
    json!({
        "id": node.id,
        "name": node.name,
        "clientURLs": node.client_urls(),
        "peerURLs": node.peer_urls,
        "status": format!("{:?}", node.status()).to_lowercase(),
        "leader": node.is_leader(),
    })
}

pub async fn members(config: ClientConfig, format: OutputFormat) -> anyhow::Result<()> {
    let client = Client::connect(config).await?;
    let nodes = client.cluster().nodes().await?;

    match format {
        OutputFormat::Json => {
            let list: Vec<Value> = nodes.iter().map(|n| node_json(n)).collect();
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        OutputFormat::Text => {
            for node in nodes.iter() {
                println!("{node}");
            }
        }
    }
    Ok(())
}

pub async fn leader(config: ClientConfig, format: OutputFormat) -> anyhow::Result<()> {
    let client = Client::connect(config).await?;
    let Some(leader) = client.leader().await? else {
        anyhow::bail!("cluster has no leader");
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&node_json(&leader))?),
        OutputFormat::Text => println!("{} {}", leader.name, leader.endpoint()),
    }
    Ok(())
}
