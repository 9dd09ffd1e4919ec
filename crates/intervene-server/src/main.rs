use intervene::SequentialModel;
use intervene::model::AffineLayer;
use intervene_server::{BIND_VAR, DEFAULT_BIND, JobServer, serve};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let (server, jobs) = JobServer::new();
    server
        .register_model(Arc::new(SequentialModel::new(
            "toy",
            vec![
                AffineLayer::new("layer0", 2.0, 1.0),
                AffineLayer::new("layer1", 0.5, 0.0),
            ],
        )))
        .await;

    let bind = std::env::var(BIND_VAR).unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("Job service listening on {bind}");
    serve(listener, server, jobs).await?;
    Ok(())
}
