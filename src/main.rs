use anyhow::{Context, Result};
use std::sync::Arc;

mod auth;
mod config;
mod error;
mod http_client;
mod resilience;

use auth::codec::{self, TokenInspection};
use auth::{CredentialManager, CredentialStore, SqlitePersistence};
use config::{Command, Config};
use http_client::{ApiClient, ReqwestTransport};
use resilience::CircuitBreakers;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(
        base_url = %config.base_url,
        db_file = %config.db_file.display(),
        retry_preset = ?config.retry_preset,
        "Configuration loaded"
    );

    let persistence = SqlitePersistence::open(&config.db_file).with_context(|| {
        format!(
            "Failed to open credential database: {}",
            config.db_file.display()
        )
    })?;
    let store = CredentialStore::new(Arc::new(persistence));

    let transport = Arc::new(ReqwestTransport::new(
        &config.base_url,
        config.http_connect_timeout,
        config.http_request_timeout,
    )?);

    // One breaker registry for the whole process
    let breakers = Arc::new(CircuitBreakers::new());
    let manager = CredentialManager::with_breakers(
        store,
        transport.clone(),
        config.manager_config(),
        breakers,
    );

    match &config.command {
        Command::Status => print_status(&manager)?,
        Command::Token => {
            let token = manager
                .get_valid_access_token()
                .await
                .context("No valid access token available, sign in again")?;
            println!("{}", token);
        }
        Command::Renew => {
            let pair = manager.renew().await.context("Token renewal failed")?;
            tracing::info!("✅ Token renewed");
            print_claims(&pair.access_token);
        }
        Command::Logout => {
            manager.clear();
            tracing::info!("👋 Credentials cleared");
        }
        Command::Get { path } => {
            let mut client = ApiClient::new(
                transport,
                manager.clone(),
                config.retry_preset.retry_config(),
            );
            if let Some(resilience) = config.manager_config().resilience {
                client = client.with_circuit_breaker(resilience.breaker);
            }
            let body = client
                .get(path)
                .await
                .with_context(|| format!("GET {} failed", path))?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}

fn print_status(manager: &CredentialManager) -> Result<()> {
    let status = manager.get_status();
    println!("{}", serde_json::to_string_pretty(&status)?);

    if let Some(user) = manager.store().get_user() {
        println!("Signed in as {} ({})", user.username, user.id);
    }

    if let Some(token) = manager.store().get_access_token() {
        print_claims(&token);
        if codec::is_expired(&token) {
            println!("Access token is expired");
        }
    }

    Ok(())
}

fn print_claims(token: &str) {
    match codec::inspect(token) {
        TokenInspection::Valid(claims) => {
            if let Some(sub) = &claims.subject {
                println!("Subject:    {}", sub);
            }
            if let Some(exp) = claims.expires_at {
                let expires = chrono::DateTime::from_timestamp(exp, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| exp.to_string());
                println!("Expires at: {}", expires);
            }
        }
        TokenInspection::Malformed(reason) => println!("Access token is malformed: {}", reason),
        TokenInspection::Absent => println!("No access token stored"),
    }
}
