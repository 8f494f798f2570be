//! Fan-out Worker Service - Entry Point
//!
//! Runs the notification worker loops and the ingress/admin HTTP server.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    fanout_worker::run().await
}
