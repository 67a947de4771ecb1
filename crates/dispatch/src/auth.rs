use crate::error::{Error, Result};
use crate::store::{Db, UserRow};
use anyhow::Context;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Issues a fresh URL-safe API key.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Trailing characters shown in dashboards so users can tell keys apart.
pub fn api_key_hint(api_key: &str) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    let start = chars.len().saturating_sub(6);
    chars[start..].iter().collect()
}

pub fn hash_api_key(api_key: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(api_key.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash api key: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_api_key(api_key: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(api_key.as_bytes(), &parsed)
        .is_ok()
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

pub fn create_access_token(user_id: Uuid, secret: &str, ttl_secs: i64) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("encode access token")
}

pub fn decode_access_token(token: &str, secret: &str) -> Result<Uuid> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
    )
    .map_err(|_| Error::auth("Invalid token"))?;
    data.claims
        .sub
        .parse::<Uuid>()
        .map_err(|_| Error::auth("Invalid token subject"))
}

/// Resolves an API key to its active user. Hashes are salted, so this scans
/// the candidates and verifies each.
pub async fn authenticate_api_key(db: &Db, api_key: &str) -> Result<Option<UserRow>> {
    let users = db.active_users().await?;
    for user in users {
        if verify_api_key(api_key, &user.api_key_hash) {
            return Ok(Some(user));
        }
    }
    Ok(None)
}

/// Makes sure the configured admin account exists; first boot of a fresh
/// database creates it from the bootstrap key.
pub async fn bootstrap_admin(db: &Db, email: &str, api_key: &str) -> Result<UserRow> {
    if let Some(user) = db.user_by_email(email).await? {
        return Ok(user);
    }
    let hash = hash_api_key(api_key)?;
    let user = db
        .insert_user(email, &hash, &api_key_hint(api_key), true)
        .await?;
    tracing::info!(email, "bootstrapped admin user");
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_roundtrip() {
        let key = generate_api_key();
        assert!(key.len() >= 40);
        let hash = hash_api_key(&key).unwrap();
        assert!(verify_api_key(&key, &hash));
        assert!(!verify_api_key("wrong-key", &hash));
        assert!(!verify_api_key(&key, "not-a-phc-string"));
    }

    #[test]
    fn hint_is_last_six_chars() {
        assert_eq!(api_key_hint("abcdefghij"), "efghij");
        assert_eq!(api_key_hint("abc"), "abc");
    }

    #[test]
    fn token_roundtrip() {
        let user_id = Uuid::new_v4();
        let token = create_access_token(user_id, "secret", 3600).unwrap();
        assert_eq!(decode_access_token(&token, "secret").unwrap(), user_id);
        assert!(decode_access_token(&token, "other-secret").is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = create_access_token(Uuid::new_v4(), "secret", -120).unwrap();
        assert!(decode_access_token(&token, "secret").is_err());
    }
}
