use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use std::sync::Arc;

use session_keeper::auth::{
    redact, AuthClient, HttpAuthClient, MigrationOutcome, TokenLifecycleManager,
};
use session_keeper::config::{Command, Config, LogFormat, StoreKind};
use session_keeper::store::{KeyringStore, LegacyStore, MemoryStore, SecureStore, SqliteLegacyStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    init_logging(&config);

    tracing::info!("Session Keeper v{} starting...", env!("CARGO_PKG_VERSION"));
    tracing::debug!(
        service = %config.service_name,
        store = ?config.store_kind,
        auth_url = %config.auth_base_url,
        "Configuration loaded"
    );

    let manager = build_manager(&config)?;
    manager.restore_session().await;

    run_command(&manager, &config.command).await
}

/// Initialize logging with the configured level and format
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wire the secure store, legacy store and auth client into a manager
fn build_manager(config: &Config) -> Result<TokenLifecycleManager> {
    let store: Arc<dyn SecureStore> = match config.store_kind {
        StoreKind::Keyring => Arc::new(KeyringStore::new(config.service_name.clone())),
        StoreKind::Memory => {
            tracing::warn!("Using in-memory store, the session will not outlive this process");
            Arc::new(MemoryStore::new())
        }
    };

    let legacy: Option<Arc<dyn LegacyStore>> = match &config.legacy_db_file {
        Some(path) => match SqliteLegacyStore::open(path) {
            Ok(db) => {
                tracing::debug!("Legacy database: {}", path.display());
                Some(Arc::new(db))
            }
            Err(e) => {
                tracing::warn!("Legacy database unavailable ({}): {}", path.display(), e);
                None
            }
        },
        None => None,
    };

    let client: Arc<dyn AuthClient> = Arc::new(
        HttpAuthClient::new(config.auth_base_url.clone(), config.http_timeout())
            .context("Failed to create auth client")?,
    );

    TokenLifecycleManager::new(store, client, legacy, config.manager_settings())
}

async fn run_command(manager: &TokenLifecycleManager, command: &Command) -> Result<()> {
    match command {
        Command::Status => print_status(manager),

        Command::Login { username } => {
            let username = match username {
                Some(name) => name.clone(),
                None => Input::new()
                    .with_prompt("Username")
                    .interact_text()
                    .context("Failed to read username")?,
            };
            let password = Password::new()
                .with_prompt("Password")
                .interact()
                .context("Failed to read password")?;

            if !manager.login(&username, &password).await {
                anyhow::bail!("Login failed");
            }
            println!("Logged in as user {}", manager.get_current_user_id().unwrap_or_default());
        }

        Command::Token { fresh } => {
            let token = if *fresh {
                manager.get_valid_access_token().await
            } else {
                manager.get_access_token()
            };
            println!("{}", token.context("Not logged in")?);
        }

        Command::Header => {
            let header = manager
                .get_authorization_header()
                .await
                .context("No valid session")?;
            println!("{}", header);
        }

        Command::Refresh => {
            let token = manager.force_refresh().await.context("Refresh failed")?;
            println!("Refreshed (token: {})", redact(&token));
        }

        Command::Logout => {
            manager.logout().await;
            println!("Logged out");
        }

        Command::Migrate => match manager.migrate_legacy_storage().await {
            MigrationOutcome::Migrated { user_id } => {
                println!("Migrated legacy session for user {}", user_id)
            }
            MigrationOutcome::AlreadyMigrated => {
                println!("Secure storage already holds a session; legacy keys removed")
            }
            MigrationOutcome::NothingToMigrate => println!("Nothing to migrate"),
            MigrationOutcome::Failed(reason) => anyhow::bail!("Migration failed: {}", reason),
        },
    }

    Ok(())
}

fn print_status(manager: &TokenLifecycleManager) {
    let session = manager.session();
    let Some(credential) = session.current() else {
        println!("  Status:      logged out");
        return;
    };

    println!("  Status:      logged in");
    println!("  User:        {}", credential.user_id);
    println!("  Token:       {}", redact(&credential.access_token));
    println!(
        "  Refreshable: {}",
        if credential.refresh_token.is_some() { "yes" } else { "no" }
    );
    match credential.expires_at {
        Some(expires_at) => println!("  Expires:     {}", expires_at.to_rfc3339()),
        None => println!("  Expires:     unknown"),
    }
    println!(
        "  Valid:       {}",
        if manager.is_token_valid() { "yes" } else { "refresh needed" }
    );
}
