//! RFC 2617 digest arithmetic, nonces and the fixed 407 challenge.

use crate::error::AuthError;
use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Protection space. Part of every digest key, so changing it invalidates
/// all digests clients have cached.
pub const AUTH_REALM: &str = "cow proxy";

/// Nonces older than this are refused with a fresh challenge.
pub const NONCE_MAX_AGE_SECS: i64 = 60;

const CHALLENGE_BODY: &str = "<!DOCTYPE html>
<html>
\t<head> <title>COW Proxy</title> </head>
\t<body>
\t\t<h1>407 Proxy authentication required</h1>
\t\t<hr />
\t\tGenerated by <i>COW</i>
\t</body>
</html>
";

pub fn md5_hex(data: &str) -> String {
    format!("{:x}", md5::compute(data))
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Lowercase hex of the Unix time in seconds, no padding.
pub fn gen_nonce(now: i64) -> String {
    format!("{now:x}")
}

/// Recover the issue time from a nonce produced by [`gen_nonce`].
pub fn parse_nonce(nonce: &str) -> Result<i64, AuthError> {
    i64::from_str_radix(nonce, 16).map_err(|_| AuthError::InvalidNonce(nonce.to_string()))
}

pub fn nonce_expired(nonce_time: i64, now: i64) -> bool {
    now.saturating_sub(nonce_time) > NONCE_MAX_AGE_SECS
}

/// Request-Digest for `qop=auth` (RFC 2617 section 3.2.2.1).
pub fn request_digest(
    ha1: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"))
}

/// Render the complete 407 response carrying `nonce`.
pub fn challenge_response(nonce: &str) -> Result<String, AuthError> {
    let mut out = String::with_capacity(256 + CHALLENGE_BODY.len());
    write!(
        out,
        "HTTP/1.1 407 Proxy Authentication Required\r\n\
         Proxy-Authenticate: Digest realm=\"{AUTH_REALM}\", nonce=\"{nonce}\", qop=\"auth\"\r\n\
         Content-Type: text/html\r\n\
         Cache-Control: no-cache\r\n\
         Content-Length: {}\r\n\r\n{CHALLENGE_BODY}",
        CHALLENGE_BODY.len()
    )
    .map_err(|_| AuthError::InternalTemplateError)?;
    Ok(out)
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}
