mod config;
mod logging;

use std::sync::Arc;

use billing_core::{BillingError, BillingErrorCategory, ProductDetails, UiHandle};
use billing_platform::{LaunchOutcome, ScriptedBillingBackend};
use billing_runtime::{BillingHandle, spawn_runtime};
use config::BillingSmokeConfig;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    logging::init();

    let config = match BillingSmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    let backend = ScriptedBillingBackend::default().with_product(ProductDetails::in_app(
        config.product_id.clone(),
        "Smoke product",
        "$0.99",
    ));
    backend.set_launch_outcome(LaunchOutcome::Purchased {
        acknowledged: false,
    });

    let handle = spawn_runtime(Arc::new(backend), config.runtime.clone());
    let printer = tokio::spawn(print_events(handle.clone()));

    let outcome = run_flow(&handle, &config.product_id).await;
    if let Err(err) = handle.disconnect().await {
        warn!(error = %err, "disconnect after smoke run failed");
    }
    drop(handle);
    let _ = printer.await;

    if let Err(err) = outcome {
        eprintln!("Billing smoke failed: {err}");
        std::process::exit(1);
    }
}

async fn run_flow(handle: &BillingHandle, product_id: &str) -> Result<(), BillingError> {
    if !handle.connect().await? {
        return Err(BillingError::new(
            BillingErrorCategory::Connection,
            "connect_failed",
            "billing backend did not connect",
        ));
    }

    let product = handle.query_catalog([product_id]).await?;
    info!(
        product_id = %product.product_id,
        price = ?product.formatted_price,
        "catalog product resolved"
    );

    let owned = handle.is_purchased(product_id).await?;
    info!(owned, "ownership checked");

    let purchased = handle.purchase(UiHandle::new("smoke"), product).await?;
    info!(purchased, "purchase resolved");

    let consumed = handle.consume().await?;
    info!(consumed, "consume resolved");

    let owned = handle.is_purchased(product_id).await?;
    info!(owned, "ownership rechecked");
    Ok(())
}

async fn print_events(handle: BillingHandle) {
    let mut events = handle.subscribe();
    drop(handle);

    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(error = %err, "failed to encode billing event"),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
