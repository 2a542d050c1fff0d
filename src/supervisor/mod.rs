pub mod routes;
pub mod service;
pub mod sse;

pub use routes::router;
pub use service::Supervisor;

use crate::config::SupervisorConfig;
use crate::errors::MirrorClawResult;

/// Serves the control plane until the listener fails.
pub async fn serve(supervisor: Supervisor, cfg: &SupervisorConfig, token: Option<String>) -> MirrorClawResult<()> {
    let addr = format!("{}:{}", cfg.bind, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, auth = token.is_some(), "supervisor listening");
    axum::serve(listener, router(supervisor, token)).await?;
    Ok(())
}
