//! Sign-in codes and session tokens
//!
//! Sign-in is passwordless: a 6-digit code is emailed to the address, its
//! SHA-256 hash is stored with an expiry, and a successful verify mints an
//! HMAC-signed bearer token of the form `base64(user_id|expiry).tag`.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Sign-in codes stay valid for this long.
pub const OTP_TTL_MINUTES: i64 = 10;

/// Session tokens stay valid for this long.
pub const TOKEN_TTL_DAYS: i64 = 30;

/// Generate a 6-digit sign-in code.
pub fn generate_otp() -> String {
    let code: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:06}", code)
}

/// Hash a sign-in code for storage; only the hash ever touches the database.
pub fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// Expiry timestamp for a code issued now.
pub fn otp_expiry() -> String {
    (chrono::Utc::now() + chrono::Duration::minutes(OTP_TTL_MINUTES)).to_rfc3339()
}

/// Rough shape check; the real proof of ownership is the emailed code.
pub fn is_valid_email(email: &str) -> bool {
    let email_regex = regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    email_regex.is_match(email)
}

/// Mint a signed session token for a user id.
pub fn sign_token(secret: &str, user_id: &str) -> Result<String> {
    let expiry = (chrono::Utc::now() + chrono::Duration::days(TOKEN_TTL_DAYS)).timestamp();
    let payload = URL_SAFE_NO_PAD.encode(format!("{}|{}", user_id, expiry));

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .context("Failed to initialize token signer")?;
    mac.update(payload.as_bytes());
    let tag = hex::encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", payload, tag))
}

/// Verify a session token and return its user id.
pub fn verify_token(secret: &str, token: &str) -> Result<String> {
    let (payload, tag) = token
        .split_once('.')
        .context("Malformed token: missing signature")?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .context("Failed to initialize token signer")?;
    mac.update(payload.as_bytes());
    let expected = hex::decode(tag).context("Malformed token: bad signature encoding")?;
    mac.verify_slice(&expected)
        .map_err(|_| anyhow::anyhow!("Token signature mismatch"))?;

    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .context("Malformed token: bad payload encoding")?;
    let decoded = String::from_utf8(decoded).context("Malformed token: non-UTF8 payload")?;

    let (user_id, expiry) = decoded
        .split_once('|')
        .context("Malformed token: missing expiry")?;
    let expiry: i64 = expiry.parse().context("Malformed token: bad expiry")?;

    if expiry < chrono::Utc::now().timestamp() {
        anyhow::bail!("Token expired");
    }

    Ok(user_id.to_string())
}

/// Pull a bearer token out of an `Authorization` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
