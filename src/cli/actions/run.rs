use crate::cli::actions::Action;
use crate::config::Config;
use crate::exporter::new;
use anyhow::Result;
use tracing::info;

/// Handle the run action
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the exporter fails to start
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run { http_addr, config } => {
            let config = Config::load(&config)?;
            info!(metrics = config.metrics.len(), "configuration loaded");
            new(http_addr, config).await?;
        }
    }

    Ok(())
}
