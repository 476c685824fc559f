//! Runs three inventory nodes and a client on an in-memory mesh.
//!
//! The client fans a stock query out to every node, then places an order with
//! failover while one node is partitioned away. Set `RUST_LOG=debug` to watch
//! the dispatcher correlate replies and quarantine the silent node.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meshcall::ApplicationError;
use meshcall::CallOptions;
use meshcall::Dispatcher;
use meshcall::JsonCodec;
use meshcall::MemoryMesh;
use meshcall::NodeRegistry;
use meshcall::Recipients;
use meshcall::handler_fn;

#[derive(Serialize, Deserialize, Debug)]
struct Stock {
    sku: String,
    units: u32,
}

#[derive(Serialize, Deserialize, Debug)]
struct Order {
    sku: String,
    units: u32,
}

#[derive(Serialize, Deserialize, Debug)]
struct Receipt {
    warehouse: String,
    units: u32,
}

fn node(mesh: &MemoryMesh, name: &str, nodes: Arc<NodeRegistry>) -> anyhow::Result<Dispatcher> {
    let (transport, inbound) = mesh.join(name);
    let dispatcher = Dispatcher::builder()
        .local_address(name)
        .transport(transport)
        .nodes(nodes)
        .default_timeout(Duration::from_millis(300))
        .build()?;
    dispatcher.spawn_pump(inbound);
    Ok(dispatcher)
}

fn warehouse(mesh: &MemoryMesh, name: &str, units: u32) -> anyhow::Result<Dispatcher> {
    let dispatcher = node(mesh, name, Arc::new(NodeRegistry::default()))?;

    dispatcher.serve(
        "stock",
        handler_fn(move |_from, payload| async move {
            let sku: String = serde_json::from_slice(&payload).map_err(|e| ApplicationError::new(e.to_string()))?;
            serde_json::to_vec(&Stock { sku, units }).map_err(|e| ApplicationError::new(e.to_string()))
        }),
    );

    let me = name.to_string();
    dispatcher.serve(
        "order",
        handler_fn(move |from, payload| {
            let me = me.clone();
            async move {
                let order: Order = serde_json::from_slice(&payload).map_err(|e| ApplicationError::new(e.to_string()))?;
                if order.units > units {
                    return Err(ApplicationError::new(format!("only {} units of {} left", units, order.sku)));
                }
                info!(warehouse = %me, %from, sku = %order.sku, units = order.units, "order accepted");
                serde_json::to_vec(&Receipt { warehouse: me, units: order.units })
                    .map_err(|e| ApplicationError::new(e.to_string()))
            }
        }),
    );

    Ok(dispatcher)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mesh = MemoryMesh::new();
    let warehouses = [
        warehouse(&mesh, "north", 12)?,
        warehouse(&mesh, "south", 3)?,
        warehouse(&mesh, "east", 40)?,
    ];

    let registry = Arc::new(NodeRegistry::default());
    let client = node(&mesh, "client", registry.clone())?;
    for w in &warehouses {
        registry.announce(w.local_address(), w.served_methods());
    }
    let _tracker = client.track_membership(&*mesh.membership());

    let stock = client
        .call(Recipients::all(), "stock", "bolt", &JsonCodec::<Stock>::new(), None, CallOptions::default())
        .await?;
    let mut stock: Vec<_> = stock.into_iter().collect();
    stock.sort_by(|a, b| a.0.cmp(&b.0));
    for (from, result) in stock {
        match result {
            Ok(s) => info!(%from, sku = %s.sku, units = s.units, "stock"),
            Err(e) => info!(%from, error = %e, "stock query failed"),
        }
    }

    mesh.isolate(warehouses[0].local_address());
    let order = Order { sku: "bolt".into(), units: 5 };
    match client.call_one("order", &order, &JsonCodec::<Receipt>::new(), None).await {
        Ok(receipt) => info!(warehouse = %receipt.warehouse, units = receipt.units, "order placed"),
        Err(e) => info!(error = %e, "order failed"),
    }

    for w in &warehouses {
        if let Some(health) = registry.health(w.local_address()) {
            info!(node = %health.address, quarantined = health.quarantined, "health");
        }
    }

    mesh.heal(warehouses[0].local_address());
    mesh.leave(warehouses[1].local_address());
    tokio::time::sleep(Duration::from_millis(10)).await;
    info!(servers = ?registry.servers_of("order"), "after south left");

    Ok(())
}
