//! Identity verification at the transport boundary.
//!
//! This crate never signs a session cookie — that's the out-of-scope
//! login endpoint's job. It only verifies one, per the literal wire
//! contract: `base64(JSON{username,exp}) + "." + hmacSHA256(secret,
//! jsonBytes)`. On a valid cookie the `username` is resolved to
//! `{uid, gid, home}` via the host's user database, the same way
//! `lookup_user` does below, since the cookie body carries only
//! `{username, exp}`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use nix::unistd::User;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("malformed session cookie")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("cookie expired")]
    Expired,
    #[error("unknown local user: {0}")]
    UnknownUser(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CookieBody {
    username: String,
    exp: i64,
}

/// The authenticated identity the rest of the gateway operates on:
/// the host user's `{username, uid, gid, home}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// Verify a `session` cookie value against `secret` and resolve the
/// carried username to a full local-user identity.
pub fn verify_identity(cookie: &str, secret: &[u8]) -> Result<Identity, AuthError> {
    let (body_b64, sig_hex) = cookie.split_once('.').ok_or(AuthError::Malformed)?;

    let body_bytes = BASE64.decode(body_b64).map_err(|_| AuthError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&body_bytes);
    let expected = mac.finalize().into_bytes();
    let expected_hex = hex_encode(&expected);

    if !constant_time_eq(expected_hex.as_bytes(), sig_hex.as_bytes()) {
        return Err(AuthError::BadSignature);
    }

    let body: CookieBody =
        serde_json::from_slice(&body_bytes).map_err(|_| AuthError::Malformed)?;

    let now = current_unix_time();
    if body.exp <= now {
        return Err(AuthError::Expired);
    }

    lookup_user(&body.username)
}

/// Resolve a local username to its uid/gid/home via the host's user
/// database (NSS-aware, so this also works against LDAP/sssd-backed
/// systems, not just `/etc/passwd`).
pub fn lookup_user(username: &str) -> Result<Identity, AuthError> {
    let user = User::from_name(username)
        .map_err(|_| AuthError::UnknownUser(username.to_string()))?
        .ok_or_else(|| AuthError::UnknownUser(username.to_string()))?;

    Ok(Identity {
        username: username.to_string(),
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        home: user.dir.to_string_lossy().to_string(),
    })
}

fn current_unix_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Constant-time byte comparison; avoids leaking signature-match
/// progress through timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Build a signed cookie value. Only used by tests to construct
/// fixtures; production cookies are signed by the external login
/// endpoint, not by this crate.
#[cfg(test)]
fn sign_cookie(username: &str, exp: i64, secret: &[u8]) -> String {
    let body = CookieBody {
        username: username.to_string(),
        exp,
    };
    let body_bytes = serde_json::to_vec(&body).unwrap();
    let body_b64 = BASE64.encode(&body_bytes);
    let mut mac = HmacSha256::new_from_slice(secret).unwrap();
    mac.update(&body_bytes);
    let sig = hex_encode(&mac.finalize().into_bytes());
    format!("{body_b64}.{sig}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_cookie_for_root() {
        let secret = b"test-secret";
        let exp = current_unix_time() + 3600;
        let cookie = sign_cookie("root", exp, secret);
        let identity = verify_identity(&cookie, secret).expect("should verify");
        assert_eq!(identity.username, "root");
        assert_eq!(identity.uid, 0);
    }

    #[test]
    fn rejects_wrong_secret() {
        let exp = current_unix_time() + 3600;
        let cookie = sign_cookie("root", exp, b"secret-a");
        let err = verify_identity(&cookie, b"secret-b").unwrap_err();
        assert!(matches!(err, AuthError::BadSignature));
    }

    #[test]
    fn rejects_expired_cookie() {
        let secret = b"test-secret";
        let exp = current_unix_time() - 10;
        let cookie = sign_cookie("root", exp, secret);
        let err = verify_identity(&cookie, secret).unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[test]
    fn rejects_malformed_cookie() {
        let err = verify_identity("not-a-cookie", b"secret").unwrap_err();
        assert!(matches!(err, AuthError::Malformed));
    }

    #[test]
    fn rejects_unknown_user() {
        let secret = b"test-secret";
        let exp = current_unix_time() + 3600;
        let cookie = sign_cookie(
            "definitely-not-a-real-user-xyz123",
            exp,
            secret,
        );
        let err = verify_identity(&cookie, secret).unwrap_err();
        assert!(matches!(err, AuthError::UnknownUser(_)));
    }

    #[test]
    fn lookup_root_succeeds() {
        let identity = lookup_user("root").expect("root must exist");
        assert_eq!(identity.uid, 0);
        assert!(!identity.home.is_empty());
    }

    #[test]
    fn lookup_nonexistent_user_fails() {
        let result = lookup_user("definitely-not-a-real-user-xyz123");
        assert!(result.is_err());
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn constant_time_eq_accepts_equal() {
        assert!(constant_time_eq(b"abc", b"abc"));
    }
}
