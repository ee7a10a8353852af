mod chat;
mod config;
mod genres;
mod router;
mod session;
mod storage;
mod tg;
mod tmdb;

use std::sync::Arc;

use dotenvy::dotenv;
use teloxide::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env()?;

    let bot = Bot::new(config.telegram_token.clone());
    let catalog = match &config.tmdb_base_url {
        Some(url) => tmdb::TmdbClient::with_base_url(config.tmdb_api_key.clone(), url.clone()),
        None => tmdb::TmdbClient::new(config.tmdb_api_key.clone()),
    };
    let genres = genres::GenreCache::new(catalog.clone());
    let store = storage::FavoritesStore::open(config.store_path.clone()).await?;

    tracing::info!(admin_id = config.admin_id, store = %config.store_path.display(), "starting movie bot");

    let router = router::Router::new(bot.clone(), catalog, genres, store, config.admin_id)
        .with_broadcast_delay(config.broadcast_delay);

    tg::run(bot, Arc::new(router)).await;
    Ok(())
}
