//! Client credential store for the SOCKS5 front end

use crate::{Error, Result};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

const GENERATED_CREDENTIAL_LEN: usize = 16;
const USERNAME_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const PASSWORD_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()-_=+";

/// One client account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub allowed: bool,
}

/// In-memory credential store keyed by username.
///
/// The gateway only consults this during the SOCKS5 authentication
/// sub-negotiation; by the time a dial is attempted the client has
/// already been verified.
pub struct UserStore {
    clients: RwLock<HashMap<String, ClientConfig>>,
}

impl UserStore {
    pub fn new() -> Self {
        UserStore {
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_client(&self, username: &str, password: &str, allowed: bool) {
        self.clients.write().insert(
            username.to_string(),
            ClientConfig {
                username: username.to_string(),
                password: password.to_string(),
                allowed,
            },
        );
    }

    pub fn set_users(&self, users: Vec<ClientConfig>) {
        let mut clients = self.clients.write();
        clients.clear();
        for user in users {
            clients.insert(user.username.clone(), user);
        }
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Check a username/password pair against the store.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let client = match self.clients.read().get(username).cloned() {
            Some(c) => c,
            None => {
                warn!(username = %username, "auth attempt: client not found");
                return false;
            }
        };

        if !client.allowed {
            warn!(username = %username, "auth attempt: client access denied");
            return false;
        }
        if client.password != password {
            warn!(username = %username, "auth attempt: invalid password");
            return false;
        }
        info!(username = %username, "auth success");
        true
    }
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Load users from a JSON file
pub fn load_users_from_file(path: impl AsRef<Path>) -> Result<Vec<ClientConfig>> {
    let path = path.as_ref();
    let data = std::fs::read(path)
        .map_err(|e| Error::config(format!("failed to read users file '{}': {}", path.display(), e)))?;

    let users: Vec<ClientConfig> = serde_json::from_slice(&data)
        .map_err(|e| Error::parse(format!("failed to parse users file '{}': {}", path.display(), e)))?;

    if users.is_empty() {
        return Err(Error::config(format!(
            "no users found in file '{}'",
            path.display()
        )));
    }

    Ok(users)
}

/// Generate a random client account and log its credentials once, for
/// deployments that start without a users file.
pub fn generate_default_user() -> ClientConfig {
    let username = random_string(GENERATED_CREDENTIAL_LEN, USERNAME_CHARS);
    let password = random_string(GENERATED_CREDENTIAL_LEN, PASSWORD_CHARS);

    warn!("no users configured, generating a random account");
    warn!("======== DEFAULT USER CREDENTIALS (save these!) ========");
    warn!(username = %username, password = %password, "generated");
    warn!("========================================================");

    ClientConfig {
        username,
        password,
        allowed: true,
    }
}

fn random_string(len: usize, charset: &[u8]) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}
