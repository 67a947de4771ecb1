use crate::controller::Controller;
use crate::error::{Error, Result};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// Payment-provider webhook settings. `variant_credits` maps a provider
/// variant id to a credit amount that overrides the paid USD amount.
#[derive(Debug, Clone, Default)]
pub struct LemonSettings {
    pub webhook_secret: Option<String>,
    pub variant_credits: HashMap<String, f64>,
    pub auto_create_users: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAck {
    Ok,
    Ignored,
}

/// Constant-time check of the provider's HMAC-SHA256 signature over the raw
/// request body. The header carries the hex digest.
pub fn verify_signature(secret: &str, signature: &str, body: &[u8]) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// USD amount from the webhook attributes: either `total_usd` directly, or
/// `total`/`subtotal` in cents which must be USD-denominated.
pub fn parse_amount_usd(attributes: &serde_json::Value) -> Result<f64> {
    if let Some(total_usd) = attributes.get("total_usd").and_then(json_number) {
        return Ok(total_usd);
    }
    for field in ["total", "subtotal"] {
        let (Some(cents), Some(currency)) = (
            attributes.get(field).and_then(json_number),
            attributes.get("currency").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        if !currency.eq_ignore_ascii_case("USD") {
            return Err(Error::validation("Unsupported currency"));
        }
        return Ok(cents / 100.0);
    }
    Err(Error::validation("Missing payment amount"))
}

fn json_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

const PROCESSED_EVENTS: &[&str] = &["order_created", "subscription_payment_success"];

impl Controller {
    /// Ingests one signed payment webhook. Retries are idempotent: a payload
    /// whose external id was already posted is acknowledged without effect.
    pub async fn ingest_payment_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookAck> {
        let lemon = self.lemon().clone();
        let secret = lemon
            .webhook_secret
            .as_deref()
            .ok_or_else(|| Error::config("Webhook not configured"))?;

        let signature = signature.ok_or_else(|| Error::auth("Invalid signature"))?;
        if !verify_signature(secret, signature, body) {
            return Err(Error::auth("Invalid signature"));
        }

        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|_| Error::validation("Malformed payload"))?;
        let event = payload
            .pointer("/meta/event_name")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !PROCESSED_EVENTS.contains(&event) {
            return Ok(WebhookAck::Ignored);
        }

        let data = payload.get("data").cloned().unwrap_or_default();
        let attributes = data.get("attributes").cloned().unwrap_or_default();
        let external_id = match data.get("id") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let email = attributes
            .get("user_email")
            .or_else(|| attributes.get("email"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if external_id.is_empty() || email.is_empty() {
            return Err(Error::validation("Missing email or id"));
        }

        if self.ledger().external_id_exists(&external_id).await? {
            return Ok(WebhookAck::Ok);
        }

        let amount_usd = parse_amount_usd(&attributes)?;
        let mut credits = amount_usd;
        if let Some(variant_id) = attributes.get("variant_id") {
            let key = match variant_id {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => String::new(),
            };
            if let Some(mapped) = lemon.variant_credits.get(&key) {
                credits = *mapped;
            }
        }

        let user = match self.db().user_by_email(&email).await? {
            Some(user) => user,
            None => {
                if !lemon.auto_create_users {
                    return Err(Error::not_found("User not found"));
                }
                let api_key = crate::auth::generate_api_key();
                let hash = crate::auth::hash_api_key(&api_key)?;
                let user = self
                    .db()
                    .insert_user(&email, &hash, &crate::auth::api_key_hint(&api_key), false)
                    .await?;
                if let Err(err) = self
                    .mailer()
                    .send(
                        &email,
                        "Your render API key",
                        &format!("Your API key: {api_key}"),
                    )
                    .await
                {
                    tracing::warn!(err = %err, "failed to email auto-created api key");
                }
                user
            }
        };

        self.ledger()
            .purchase(user.id, credits, &external_id, "lemon")
            .await?;
        Ok(WebhookAck::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_verification() {
        let body = br#"{"meta":{"event_name":"order_created"}}"#;
        let good = sign("hook-secret", body);
        assert!(verify_signature("hook-secret", &good, body));
        assert!(!verify_signature("other-secret", &good, body));
        assert!(!verify_signature("hook-secret", &good, b"tampered"));
        assert!(!verify_signature("hook-secret", "zz-not-hex", body));
    }

    #[test]
    fn amount_prefers_total_usd() {
        let attrs = serde_json::json!({ "total_usd": 12.5, "total": 9999, "currency": "EUR" });
        assert_eq!(parse_amount_usd(&attrs).unwrap(), 12.5);
    }

    #[test]
    fn amount_from_cents_requires_usd() {
        let attrs = serde_json::json!({ "total": 2599, "currency": "USD" });
        assert_eq!(parse_amount_usd(&attrs).unwrap(), 25.99);

        let attrs = serde_json::json!({ "subtotal": 1000, "currency": "usd" });
        assert_eq!(parse_amount_usd(&attrs).unwrap(), 10.0);

        let attrs = serde_json::json!({ "total": 2599, "currency": "EUR" });
        assert!(matches!(
            parse_amount_usd(&attrs),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn amount_missing_is_rejected() {
        let attrs = serde_json::json!({ "currency": "USD" });
        assert!(parse_amount_usd(&attrs).is_err());
    }
}
