//! Basic circuit walkthrough: failures open the circuit, open circuits
//! short-circuit, and a successful probe closes them again.

use std::sync::Arc;
use std::time::Duration;

use fusewire::{CallMetrics, Circuit, CircuitError, ConcurrencyLimiter, SlidingWindowBreaker};
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    // A "payment backend" that declines large amounts.
    let circuit = Arc::new(
        Circuit::builder(|_ctx, amount: u32| async move {
            if amount > 100 {
                Err(format!("payment of {amount} declined"))
            } else {
                Ok(format!("paid {amount}"))
            }
        })
        .breaker(SlidingWindowBreaker::new(Duration::from_millis(500), 0.5))
        .middleware(ConcurrencyLimiter::new(8, false))
        .middleware(CallMetrics::new("payment_api"))
        .build()?,
    );
    let ctx = CancellationToken::new();

    println!("=== Successful calls ===");
    for amount in [10, 20] {
        match circuit.call(&ctx, amount).await {
            Ok(receipt) => println!("ok: {receipt}"),
            Err(err) => println!("error: {err}"),
        }
    }
    println!("state: {}\n", circuit.state());

    println!("=== Triggering failures ===");
    for amount in [500, 600, 700] {
        match circuit.call(&ctx, amount).await {
            Ok(receipt) => println!("ok: {receipt}"),
            Err(err) => println!("error: {err}"),
        }
    }
    println!("state: {}\n", circuit.state());

    println!("=== Calling while open ===");
    match circuit.call(&ctx, 10).await {
        Ok(receipt) => println!("ok: {receipt}"),
        Err(err @ CircuitError::Rejected(_)) => println!("short-circuited: {err}"),
        Err(err) => println!("error: {err}"),
    }
    println!("state: {}\n", circuit.state());

    println!("=== Waiting for the probe window ===");
    tokio::time::sleep(Duration::from_millis(600)).await;
    match circuit.call(&ctx, 10).await {
        Ok(receipt) => println!("probe ok: {receipt}"),
        Err(err) => println!("probe error: {err}"),
    }
    println!("state: {}", circuit.state());

    Ok(())
}
