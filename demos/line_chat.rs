//! Line chat example
//!
//! Spawns a chain of nodes over the in-memory network, sends a private
//! message from the first node to the last one, then floods a broadcast
//! and prints who heard it.
//!
//! ```text
//! cargo run --example line_chat -- --nodes 5 --max-hops 3
//! ```

use anyhow::Result;
use clap::Parser;
use meshroute::{Event, MemoryNetwork, MeshNode, MeshNodeBuilder, NodeId};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-hop chat over an in-memory mesh", long_about = None)]
struct Args {
    /// Number of nodes in the chain
    #[arg(short, long, default_value = "4")]
    nodes: usize,

    /// Hop limit for every node
    #[arg(short, long, default_value = "10")]
    max_hops: u32,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    anyhow::ensure!(args.nodes >= 2, "need at least two nodes");

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("line_chat={},meshroute={}", log_level, log_level))
        .init();

    let network = MemoryNetwork::new();
    let mut nodes: Vec<MeshNode> = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let name = format!("node{}", i);
        let builder = MeshNodeBuilder::new()
            .with_node_id(name.as_str())
            .with_device_name(format!("{} phone", name))
            .with_max_hops(args.max_hops);
        let node = network.spawn_node(builder).await?;

        node.on_event(move |event| {
            if let Event::ChatReceived {
                source,
                content,
                hop_count,
                ..
            } = event
            {
                info!("{} got \"{}\" from {} after {} hops", name, content, source, hop_count);
            }
        });
        nodes.push(node);
    }

    for pair in nodes.windows(2) {
        network.connect(pair[0].node_id(), pair[1].node_id())?;
    }
    info!("Linked {} nodes in a line", args.nodes);

    let first = &nodes[0];
    let last: NodeId = nodes[args.nodes - 1].node_id().clone();
    wait_for_route(first, &last).await;

    let outcome = first
        .send_chat_message(Some(&last), "hello from the other end")
        .await?;
    info!("Private message: {:?}", outcome);

    let outcome = first.broadcast("hello everyone").await?;
    info!("Broadcast: {:?}", outcome);

    tokio::time::sleep(Duration::from_millis(200)).await;

    for node in &nodes {
        let snapshot = node.snapshot();
        info!(
            "{}: {} known nodes, {} routes",
            node.node_id(),
            snapshot.nodes.len(),
            snapshot.routes.len()
        );
    }

    for node in &mut nodes {
        node.stop().await?;
    }
    Ok(())
}

/// Give link and topology announcements a moment to spread
async fn wait_for_route(node: &MeshNode, target: &NodeId) {
    for _ in 0..50 {
        if node.snapshot().route(target).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    info!("No route to {} yet, sending through discovery", target);
}
