use std::env;
use std::path::PathBuf;

use color_eyre::eyre::eyre;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::auth::TokenKeys;
use crate::media::MediaClient;

/// Secrets and lifetimes for the two token classes. Read from the
/// environment once at startup and injected into [`TokenKeys`]; business
/// logic never touches the environment.
#[derive(Clone)]
pub struct AuthConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
}

impl AuthConfig {
    pub fn from_env() -> color_eyre::Result<Self> {
        Ok(Self {
            access_secret: env::var("ACCESS_TOKEN_SECRET")?,
            refresh_secret: env::var("REFRESH_TOKEN_SECRET")?,
            access_ttl_seconds: env_i64("ACCESS_TOKEN_TTL_SECONDS", 60 * 60 * 24)?,
            refresh_ttl_seconds: env_i64("REFRESH_TOKEN_TTL_SECONDS", 60 * 60 * 24 * 10)?,
        })
    }
}

/// Endpoint and credentials for the third-party media host, plus the local
/// directory where uploads are staged before being pushed to it.
#[derive(Clone)]
pub struct MediaConfig {
    pub upload_url: String,
    pub api_key: String,
    pub staging_dir: PathBuf,
}

impl MediaConfig {
    pub fn from_env() -> color_eyre::Result<Self> {
        Ok(Self {
            upload_url: env::var("MEDIA_UPLOAD_URL")?,
            api_key: env::var("MEDIA_API_KEY")?,
            staging_dir: env::var("MEDIA_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub tokens: TokenKeys,
    pub media: MediaClient,
}

impl AppState {
    pub async fn from_env() -> color_eyre::Result<Self> {
        let pool = setup_db_pool().await?;
        let tokens = TokenKeys::new(&AuthConfig::from_env()?);
        let media = MediaClient::new(MediaConfig::from_env()?);

        Ok(Self {
            db: pool,
            tokens,
            media,
        })
    }
}

#[tracing::instrument(err)]
pub async fn setup_db_pool() -> color_eyre::Result<PgPool> {
    const MIGRATION_LOCK_ID: i64 = 0x5F_AC_C0_4D_B0_07;

    let database_url = env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(&pool)
        .await?;

    sqlx::migrate!("../migrations").run(&pool).await?;

    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(&pool)
        .await?;

    Ok(pool)
}

fn env_i64(name: &str, default: i64) -> color_eyre::Result<i64> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| eyre!("invalid value for {name}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_i64_falls_back_to_default() {
        env::remove_var("TTL_TEST_UNSET");
        assert_eq!(env_i64("TTL_TEST_UNSET", 42).unwrap(), 42);
    }

    #[test]
    fn env_i64_parses_an_override() {
        env::set_var("TTL_TEST_SET", "900");
        assert_eq!(env_i64("TTL_TEST_SET", 42).unwrap(), 900);
        env::remove_var("TTL_TEST_SET");
    }

    #[test]
    fn env_i64_rejects_garbage() {
        env::set_var("TTL_TEST_BAD", "soon");
        assert!(env_i64("TTL_TEST_BAD", 42).is_err());
        env::remove_var("TTL_TEST_BAD");
    }
}
