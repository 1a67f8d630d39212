use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::info;
use uuid::Uuid;

/// A stored account record. `password_hash` and `refresh_token` never leave
/// the server; responses use [`PublicUser`].
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
    /// Exactly the most recently issued refresh token, or None when logged
    /// out. One active session per account.
    pub refresh_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field set for inserting a new account. The password must already be
/// hashed and the username/email already normalized by the caller.
#[derive(Debug)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
}

/// Sanitized projection of a user record: everything except the password
/// hash and the stored refresh token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub avatar: String,
    pub cover_image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<User> for PublicUser {
    fn from(user: User) -> Self {
        Self {
            id: user.user_id,
            username: user.username,
            email: user.email,
            full_name: user.full_name,
            avatar: user.avatar_url,
            cover_image: user.cover_image_url,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// Lowercase-and-trim normalization applied to usernames and emails before
/// they are stored or matched.
pub fn normalize_identifier(raw: &str) -> String {
    raw.trim().to_lowercase()
}

impl User {
    pub async fn create(pool: &PgPool, new_user: NewUser) -> sqlx::Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, email, full_name, password_hash, avatar_url, cover_image_url)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id AS user_id, username, email, full_name, password_hash,
                      avatar_url, cover_image_url, refresh_token, created_at, updated_at
            "#,
        )
        .bind(&new_user.username)
        .bind(&new_user.email)
        .bind(&new_user.full_name)
        .bind(&new_user.password_hash)
        .bind(&new_user.avatar_url)
        .bind(&new_user.cover_image_url)
        .fetch_one(pool)
        .await?;

        info!("created user {} ({})", user.user_id, user.username);
        Ok(user)
    }

    pub async fn get_by_id(pool: &PgPool, user_id: Uuid) -> sqlx::Result<Option<User>> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id AS user_id, username, email, full_name, password_hash,
                   avatar_url, cover_image_url, refresh_token, created_at, updated_at
            FROM users WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    /// Look up by username or email; a None on either side matches nothing
    /// on that side.
    pub async fn get_by_username_or_email(
        pool: &PgPool,
        username: Option<&str>,
        email: Option<&str>,
    ) -> sqlx::Result<Option<User>> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id AS user_id, username, email, full_name, password_hash,
                   avatar_url, cover_image_url, refresh_token, created_at, updated_at
            FROM users WHERE username = $1 OR email = $2
            LIMIT 1
            "#,
        )
        .bind(username)
        .bind(email)
        .fetch_optional(pool)
        .await
    }

    /// Narrow update: replace (or clear) the stored refresh token without
    /// touching any other column.
    pub async fn update_refresh_token(
        pool: &PgPool,
        user_id: Uuid,
        refresh_token: Option<&str>,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE users SET refresh_token = $1, updated_at = NOW() WHERE id = $2")
            .bind(refresh_token)
            .bind(user_id)
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Narrow update: replace the stored password hash. The caller hashes
    /// first, so a hashing failure never reaches this write.
    pub async fn update_password(
        pool: &PgPool,
        user_id: Uuid,
        password_hash: &str,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE users SET password_hash = $1, updated_at = NOW() WHERE id = $2")
            .bind(password_hash)
            .bind(user_id)
            .execute(pool)
            .await?;

        info!("updated password for user {user_id}");
        Ok(())
    }

    pub async fn update_profile(
        pool: &PgPool,
        user_id: Uuid,
        full_name: &str,
        email: &str,
    ) -> sqlx::Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET full_name = $1, email = $2, updated_at = NOW()
            WHERE id = $3
            RETURNING id AS user_id, username, email, full_name, password_hash,
                      avatar_url, cover_image_url, refresh_token, created_at, updated_at
            "#,
        )
        .bind(full_name)
        .bind(email)
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        info!("updated account details for user {user_id}");
        Ok(user)
    }

    pub async fn update_avatar(
        pool: &PgPool,
        user_id: Uuid,
        avatar_url: &str,
    ) -> sqlx::Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET avatar_url = $1, updated_at = NOW()
            WHERE id = $2
            RETURNING id AS user_id, username, email, full_name, password_hash,
                      avatar_url, cover_image_url, refresh_token, created_at, updated_at
            "#,
        )
        .bind(avatar_url)
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        info!("updated avatar for user {user_id}");
        Ok(user)
    }

    pub async fn update_cover_image(
        pool: &PgPool,
        user_id: Uuid,
        cover_image_url: &str,
    ) -> sqlx::Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET cover_image_url = $1, updated_at = NOW()
            WHERE id = $2
            RETURNING id AS user_id, username, email, full_name, password_hash,
                      avatar_url, cover_image_url, refresh_token, created_at, updated_at
            "#,
        )
        .bind(cover_image_url)
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        info!("updated cover image for user {user_id}");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        User {
            user_id: Uuid::new_v4(),
            username: "alice".into(),
            email: "alice@x.com".into(),
            full_name: "Alice A".into(),
            password_hash: "$argon2id$not-a-real-hash".into(),
            avatar_url: "https://media.example/a.png".into(),
            cover_image_url: Some("https://media.example/c.png".into()),
            refresh_token: Some("stored-token".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn public_user_drops_credentials() {
        let value = serde_json::to_value(PublicUser::from(sample_user())).unwrap();

        assert!(value.get("password").is_none());
        assert!(value.get("passwordHash").is_none());
        assert!(value.get("refreshToken").is_none());
    }

    #[test]
    fn public_user_uses_camel_case_field_names() {
        let value = serde_json::to_value(PublicUser::from(sample_user())).unwrap();

        assert_eq!(value["fullName"], "Alice A");
        assert_eq!(value["avatar"], "https://media.example/a.png");
        assert_eq!(value["coverImage"], "https://media.example/c.png");
        assert!(value.get("createdAt").is_some());
        assert!(value.get("updatedAt").is_some());
    }

    #[test]
    fn normalize_lowercases_and_trims() {
        assert_eq!(normalize_identifier("  Alice "), "alice");
        assert_eq!(normalize_identifier("ALICE@X.COM"), "alice@x.com");
        assert_eq!(normalize_identifier("alice"), "alice");
    }
}
