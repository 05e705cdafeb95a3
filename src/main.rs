use anyhow::{Context, Result};
use fitlink::config::{load_config, FitlinkConfig};
use fitlink::CredentialBroker;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fitlink=info".into()),
        )
        .init();

    let user_id = std::env::args()
        .nth(1)
        .context("usage: fitlink <user-id>")?;

    let mut config = match std::env::var("FITLINK_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => FitlinkConfig::default(),
    };
    config.apply_env()?;

    info!(
        backend = ?config.secrets.backend,
        login_program = %config.login.program,
        "Fitlink starting"
    );

    let broker = CredentialBroker::from_config(&config);

    match broker.exchange_tokens(&user_id, None).await {
        Ok(material) => {
            info!(user_id = %user_id, shape = ?material.shape(), "Bearer material ready");
            println!("ok: {} bytes of token material ({:?})", material.as_str().len(), material.shape());
            Ok(())
        }
        Err(e) => {
            error!(user_id = %user_id, error = %e, "Token exchange failed");
            Err(e.into())
        }
    }
}
