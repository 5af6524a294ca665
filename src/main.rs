use push_deploy_notifier::error::DeployError;
use push_deploy_notifier::logging::setup_logging;
use push_deploy_notifier::{AppState, DeployConfig, build_router};
use std::sync::Arc;
use tracing::{error, info};

async fn serve(config: DeployConfig) -> Result<(), DeployError> {
    let bind_address = config.listen_address();
    let projects_root = config.projects_root.clone();
    let state = Arc::new(AppState::from_config(config)?);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Listening on {}", bind_address);
    info!("Serving projects from {:?}", projects_root);
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config = match DeployConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    // Held until exit so buffered file logs get flushed
    let log_guard = match setup_logging(config.log_dir.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let result = serve(config).await;
    if let Err(e) = &result {
        error!("Server error: {}", e);
    }
    drop(log_guard);
    if result.is_err() {
        std::process::exit(1);
    }
}
