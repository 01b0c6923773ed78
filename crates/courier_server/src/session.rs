//! Stateless signed session tokens. A token is `base64url(claims).base64url(tag)`
//! where the tag is HMAC-SHA256 over the claims bytes, so any server instance
//! holding the shared secret can verify without a session table.

use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use courier_api::SessionUser;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

pub(crate) static SESSION_COOKIE_NAME: &str = "tc_session";

/// Sessions expire a week after login; clients just log in again.
const SESSION_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

type HmacSha256 = Hmac<Sha256>;

/// Compact claim names keep the cookie small: subject (user id), workspace,
/// display name, expiry in unix seconds.
#[derive(Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    ws: String,
    dn: String,
    exp: i64,
}

#[derive(Clone)]
pub(crate) struct SessionKey {
    secret: Arc<[u8]>,
}

impl SessionKey {
    pub(crate) fn new(secret: &str) -> Self {
        Self {
            secret: Arc::from(secret.as_bytes()),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length, so this cannot fail.
        HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }

    pub(crate) fn issue(&self, user: &SessionUser, now_ms: i64) -> String {
        let claims = SessionClaims {
            sub: user.id.clone(),
            ws: user.workspace_id.clone(),
            dn: user.display_name.clone(),
            exp: now_ms / 1000 + SESSION_TTL_SECONDS,
        };
        let payload = serde_json::to_vec(&claims).unwrap_or_default();

        let mut mac = self.mac();
        mac.update(&payload);
        let tag = mac.finalize().into_bytes();

        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode(tag)
        )
    }

    pub(crate) fn verify(&self, token: &str, now_ms: i64) -> Option<SessionUser> {
        let (payload_b64, tag_b64) = token.rsplit_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let tag = URL_SAFE_NO_PAD.decode(tag_b64).ok()?;

        let mut mac = self.mac();
        mac.update(&payload);
        // Constant-time comparison.
        mac.verify_slice(&tag).ok()?;

        let claims: SessionClaims = serde_json::from_slice(&payload).ok()?;
        if claims.exp <= 0 || claims.exp * 1000 < now_ms {
            return None;
        }

        Some(SessionUser {
            id: claims.sub,
            workspace_id: claims.ws,
            display_name: claims.dn,
        })
    }

    pub(crate) fn session_from_headers(
        &self,
        headers: &HeaderMap,
        now_ms: i64,
    ) -> Option<SessionUser> {
        let cookie = headers.get(COOKIE)?.to_str().ok()?;
        let token = cookie_value(cookie, SESSION_COOKIE_NAME)?;
        self.verify(token, now_ms)
    }
}

pub(crate) fn session_cookie(token: &str, secure: bool) -> String {
    format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={SESSION_TTL_SECONDS}{}",
        if secure { "; Secure" } else { "" }
    )
}

pub(crate) fn clear_session_cookie(secure: bool) -> String {
    format!(
        "{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0{}",
        if secure { "; Secure" } else { "" }
    )
}

fn cookie_value<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    for part in cookie_header.split(';') {
        let trimmed = part.trim();
        let Some((k, v)) = trimmed.split_once('=') else {
            continue;
        };
        if k.trim() == name {
            return Some(v.trim());
        }
    }
    None
}
