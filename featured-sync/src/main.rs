use std::sync::Arc;

use anyhow::Context;
use deviant_core::{DeviantClient, Gallery, OAuthClient, TokenManager, TokenStore};
use featured_sync::authorize::AuthorizeFlow;
use featured_sync::config::SyncConfig;
use featured_sync::storage::open_store;
use featured_sync::sync::FeaturedSync;
use featured_sync::logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Authorize,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "run" => mode = CliMode::Run,
            "authorize" => mode = CliMode::Authorize,
            "--help" | "-h" | "help" => return Ok(CliMode::Help),
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn print_usage() {
    println!("Usage: featured-sync [run|authorize]");
    println!("  run         Refill the target folder with the top favourites (default)");
    println!("  authorize   Obtain and store a refresh token via the browser");
    println!("  --help      Show this message");
}

fn bootstrap() -> anyhow::Result<(SyncConfig, Arc<dyn TokenStore>)> {
    let env_file = dotenvy::dotenv().ok();
    logging::init();
    let config = SyncConfig::from_env(env_file)?;
    let store = open_store(&config).context("failed to open token store")?;
    Ok((config, store))
}

async fn run() -> anyhow::Result<()> {
    let (config, store) = bootstrap()?;
    let credentials = config.credentials(store.as_ref())?;
    let tokens = Arc::new(TokenManager::from_credentials(credentials, store)?);
    let client = DeviantClient::new(tokens)?.with_policy(config.retry.clone())?;
    let sync = FeaturedSync::new(Gallery::new(client), config.sync_options());

    let report = sync.run().await.context("featured sync failed")?;
    tracing::info!(
        folderid = %report.target_folderid,
        removed = report.removed,
        scanned = report.scanned,
        copied = report.copied.len(),
        dry_run = report.dry_run,
        "done"
    );
    Ok(())
}

async fn authorize() -> anyhow::Result<()> {
    let (config, store) = bootstrap()?;
    let oauth = OAuthClient::new(config.client_id.clone(), config.client_secret.clone())?;
    let flow = AuthorizeFlow::new(oauth, config.redirect_port, config.scopes.clone());
    flow.authorize(store.as_ref())
        .await
        .context("authorization failed")?;
    println!("Refresh token saved ({:?} backend).", config.token_backend);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            print_usage();
            Ok(())
        }
        CliMode::Authorize => authorize().await,
        CliMode::Run => run().await,
    }
}
