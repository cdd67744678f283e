//! Fleet Orchestrator - Entry Point
//!
//! Per-machine orchestrator for the GPU compute fleet.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    fleet_orchestrator::run().await
}
