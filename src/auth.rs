//! Proxy authentication gate.
//!
//! Every request passes through [`Auth::authenticate`], which checks in order:
//! the auth-once cache of client IPs, the IP allowlist, and finally the
//! `Proxy-Authorization` header (Digest or Basic). A missing or failed header
//! makes the gate write a 407 challenge to the client itself.

use crate::allowlist::Allowlist;
use crate::config::Config;
use crate::digest::{
    challenge_response, constant_time_eq, gen_nonce, nonce_expired, parse_nonce, request_digest,
    unix_now,
};
use crate::error::{AuthError, ConfigError};
use crate::http::{parse_key_value_list, Request};
use crate::timeout_set::{normalize_ip, TimeoutSet};
use crate::users::{User, UserStore};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// What the gate needs from a client connection.
pub trait Connection: Write {
    fn remote_addr(&self) -> SocketAddr;
    fn local_addr(&self) -> SocketAddr;
}

/// Immutable after startup except for the cache of authenticated clients.
#[derive(Debug)]
pub struct Auth {
    required: bool,
    users: UserStore,
    allowlist: Allowlist,
    authed: TimeoutSet,
}

impl Auth {
    /// A gate that lets everything through.
    pub fn disabled() -> Self {
        Auth {
            required: false,
            users: UserStore::new(),
            allowlist: Allowlist::default(),
            authed: TimeoutSet::new(Duration::ZERO),
        }
    }

    pub fn new(users: UserStore, allowlist: Allowlist, auth_timeout: Duration) -> Self {
        Auth {
            required: true,
            users,
            allowlist,
            authed: TimeoutSet::new(auth_timeout),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        if !config.requires_auth() {
            return Ok(Self::disabled());
        }

        let mut users = UserStore::new();
        if let Some(spec) = &config.user_passwd {
            users.add_user(spec)?;
        }
        if let Some(path) = &config.user_passwd_file {
            users.load_file(path)?;
        }
        let allowlist = Allowlist::parse(config.allowed_client.as_deref().unwrap_or_default())?;

        if users.is_empty() && allowlist.is_empty() {
            warn!("authentication enabled but no users or allowed clients configured");
        }
        debug!(users = users.len(), "auth enabled");
        Ok(Auth::new(
            users,
            allowlist,
            Duration::from_secs(config.auth_timeout.saturating_mul(3600)),
        ))
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// `Ok(())` lets the request through. `Err(AuthRequired)` means a 407
    /// has already been written and the request must not be processed.
    /// Errors for which [`AuthError::is_bad_request`] holds should be
    /// answered with 400.
    pub fn authenticate<C: Connection>(&self, conn: &mut C, req: &Request) -> Result<(), AuthError> {
        self.authenticate_at(conn, req, unix_now())
    }

    fn authenticate_at<C: Connection>(
        &self,
        conn: &mut C,
        req: &Request,
        now: i64,
    ) -> Result<(), AuthError> {
        if !self.required {
            return Ok(());
        }

        let client_ip = normalize_ip(conn.remote_addr().ip());
        if self.authed.has(client_ip) {
            debug!(client = %client_ip, "already authed");
            return Ok(());
        }
        if self.allowlist.matches(client_ip) {
            return Ok(());
        }

        self.auth_user_passwd(conn, req, now)?;
        self.authed.add(client_ip);
        debug!(client = %client_ip, cached = self.authed.len(), "client authenticated");
        Ok(())
    }

    fn auth_user_passwd<C: Connection>(
        &self,
        conn: &mut C,
        req: &Request,
        now: i64,
    ) -> Result<(), AuthError> {
        if let Some(header) = req.proxy_authorization() {
            match self.check_proxy_authorization(conn, req, header, now) {
                Ok(()) => return Ok(()),
                Err(AuthError::AuthRequired) => {}
                Err(e) => return Err(e),
            }
        }
        Err(send_challenge(conn, now))
    }

    fn check_proxy_authorization<C: Connection>(
        &self,
        conn: &C,
        req: &Request,
        header: &str,
        now: i64,
    ) -> Result<(), AuthError> {
        trace!(client = %conn.remote_addr(), "checking proxy authorization");

        let (scheme, blob) = header
            .split_once(' ')
            .ok_or_else(|| AuthError::MalformedAuthHeader(header.to_string()))?;
        match scheme.trim().to_ascii_lowercase().as_str() {
            "digest" => self.auth_digest(conn, req, blob, now),
            "basic" => self.auth_basic(conn, blob),
            _ => Err(AuthError::UnsupportedAuthScheme(scheme.to_string())),
        }
    }

    fn auth_basic<C: Connection>(&self, conn: &C, blob: &str) -> Result<(), AuthError> {
        let decoded = STANDARD.decode(blob)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::MalformedBasicCredentials)?;
        let fields: Vec<&str> = decoded.split(':').collect();
        if fields.len() != 2 {
            return Err(AuthError::MalformedBasicCredentials);
        }
        let (name, password) = (fields[0], fields[1]);

        match self.users.lookup(name) {
            Some(user) if constant_time_eq(user.password().as_bytes(), password.as_bytes()) => {
                auth_port(conn, name, user)
            }
            _ => {
                warn!(client = %conn.remote_addr(), user = name, "basic auth failed");
                Err(AuthError::AuthRequired)
            }
        }
    }

    fn auth_digest<C: Connection>(
        &self,
        conn: &C,
        req: &Request,
        blob: &str,
        now: i64,
    ) -> Result<(), AuthError> {
        let params = parse_key_value_list(blob);
        if params.is_empty() {
            return Err(AuthError::EmptyAuthList);
        }
        let nonce = param(&params, "nonce");
        let nonce_time = parse_nonce(nonce)?;
        // Clients such as iOS open a new connection to re-authenticate.
        if nonce_expired(nonce_time, now) {
            debug!(client = %conn.remote_addr(), nonce, "stale nonce");
            return Err(AuthError::AuthRequired);
        }

        let name = param(&params, "username");
        let Some(user) = self.users.lookup(name) else {
            warn!(client = %conn.remote_addr(), user = name, "no such user");
            return Err(AuthError::AuthRequired);
        };
        auth_port(conn, name, user)?;

        let qop = param(&params, "qop");
        if qop != "auth" {
            return Err(AuthError::UnsupportedQop(qop.to_string()));
        }
        let response = params
            .get("response")
            .ok_or(AuthError::MissingResponseDigest)?;

        let expected = request_digest(
            user.digest_key(name),
            nonce,
            param(&params, "nc"),
            param(&params, "cnonce"),
            &req.method,
            &req.uri,
        );
        if !constant_time_eq(expected.as_bytes(), response.as_bytes()) {
            warn!(client = %conn.remote_addr(), user = name, "digest not match, maybe password wrong");
            return Err(AuthError::AuthRequired);
        }
        Ok(())
    }
}

fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> &'a str {
    params.get(key).map(String::as_str).unwrap_or_default()
}

fn auth_port<C: Connection>(conn: &C, name: &str, user: &User) -> Result<(), AuthError> {
    if user.port() == 0 {
        return Ok(());
    }
    if conn.local_addr().port() != user.port() {
        warn!(client = %conn.remote_addr(), user = name, "user port not match");
        return Err(AuthError::AuthRequired);
    }
    Ok(())
}

/// Write a 407 with a fresh nonce. Returns the error the request ends with.
fn send_challenge<C: Connection>(conn: &mut C, now: i64) -> AuthError {
    let response = match challenge_response(&gen_nonce(now)) {
        Ok(r) => r,
        Err(e) => return e,
    };
    trace!(client = %conn.remote_addr(), "sending auth challenge");
    match conn.write_all(response.as_bytes()).and_then(|_| conn.flush()) {
        Ok(()) => AuthError::AuthRequired,
        Err(e) => AuthError::ChallengeWriteFailed(e),
    }
}
