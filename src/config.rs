use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct MoodleConfig {
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub moodle: MoodleConfig,
    pub cors_origins: Vec<String>,
    pub listen_host: String,
    pub listen_port: u16,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        // Either a full DATABASE_URL or the individual DB_* parts.
        let database_url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                let host = std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".into());
                let user = std::env::var("DB_USER").unwrap_or_else(|_| "bridgeuser".into());
                let pass = std::env::var("DB_PASS").unwrap_or_else(|_| "bridgepass".into());
                let name = std::env::var("DB_NAME").unwrap_or_else(|_| "bridgelearn".into());
                let port = std::env::var("DB_PORT").unwrap_or_else(|_| "5432".into());
                format!("postgres://{user}:{pass}@{host}:{port}/{name}")
            }
        };

        let moodle = MoodleConfig {
            base_url: std::env::var("MOODLE_URL")
                .unwrap_or_else(|_| "http://moodle-app:80".into()),
            token: std::env::var("MOODLE_TOKEN").unwrap_or_default(),
        };

        let cors_origins = std::env::var("CORS_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let listen_host = std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let listen_port = std::env::var("APP_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(5000);

        Ok(Self {
            database_url,
            moodle,
            cors_origins,
            listen_host,
            listen_port,
        })
    }
}
