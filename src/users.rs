//! Credential store: username -> password, lazily derived digest key and an
//! optional listening-port restriction. Built once at startup.

use crate::digest::{md5_hex, AUTH_REALM};
use crate::error::ConfigError;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

pub struct User {
    password: String,
    /// HA1 of RFC 2617, `MD5(username:realm:password)`. Computed on first use.
    digest_key: OnceLock<String>,
    /// 0 means any port.
    port: u16,
}

impl User {
    fn new(password: String, port: u16) -> Self {
        User {
            password,
            digest_key: OnceLock::new(),
            port,
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The username is the store key and not kept in the record, so the
    /// caller passes it back in.
    pub fn digest_key(&self, username: &str) -> &str {
        self.digest_key
            .get_or_init(|| md5_hex(&format!("{username}:{AUTH_REALM}:{}", self.password)))
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User").field("port", &self.port).finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct UserStore {
    users: HashMap<String, User>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user from a `username:password[:port]` spec.
    pub fn add_user(&mut self, spec: &str) -> Result<(), ConfigError> {
        let (name, user) = parse_user_passwd(spec)?;
        if self.users.contains_key(&name) {
            return Err(ConfigError::DuplicateUser(name));
        }
        debug!(user = %name, port = user.port, "added user");
        self.users.insert(name, user);
        Ok(())
    }

    /// Load one user spec per line. Blank lines are skipped and an empty
    /// path means no file is configured.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        if path.as_os_str().is_empty() {
            return Ok(());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::CredentialFile {
            path: path.to_path_buf(),
            source,
        })?;
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            self.add_user(line)?;
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&User> {
        self.users.get(name)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

fn parse_user_passwd(spec: &str) -> Result<(String, User), ConfigError> {
    let fields: Vec<&str> = spec.split(':').collect();
    if fields.len() < 2 || fields.len() > 3 {
        return Err(ConfigError::MalformedCredential(spec.to_string()));
    }
    let (name, password) = (fields[0], fields[1]);
    if name.is_empty() || password.is_empty() {
        return Err(ConfigError::MalformedCredential(spec.to_string()));
    }

    let mut port = 0u16;
    if fields.len() == 3 && !fields[2].is_empty() {
        port = match fields[2].parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => return Err(ConfigError::MalformedCredential(spec.to_string())),
        };
    }

    Ok((name.to_string(), User::new(password.to_string(), port)))
}
