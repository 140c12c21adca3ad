use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::moodle::{MoodleClient, MoodleHttpClient};

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub moodle: Arc<dyn MoodleClient>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let db = PgPoolOptions::new()
            .max_connections(20)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;

        let moodle =
            Arc::new(MoodleHttpClient::new(&config.moodle)?) as Arc<dyn MoodleClient>;

        Ok(Self { db, config, moodle })
    }
}
