use std::collections::HashMap;
use std::time::{Duration, Instant};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use flagpanel_lib::api::User;
use flagpanel_lib::FlagError;
use rand_core::{OsRng, RngCore};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::config::OperatorConfig;

const SESSION_TOKEN_BYTES: usize = 32;

/// Hash a password into an Argon2id PHC string.
pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| err.to_string())
}

/// Check a password against a PHC string. Malformed hashes never match.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            warn!(error = %err, "operator password hash is not a valid PHC string");
            false
        }
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; SESSION_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

struct SessionRecord {
    email: String,
    expires_at: Instant,
}

/// Signed-in operator sessions, kept in memory. Restarting the server signs
/// everybody out.
pub struct SessionStore {
    operators: HashMap<String, String>,
    ttl: Duration,
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    pub fn new(operators: &[OperatorConfig], ttl: Duration) -> Self {
        let operators = operators
            .iter()
            .map(|op| (op.email.trim().to_lowercase(), op.password_hash.clone()))
            .collect();
        Self {
            operators,
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Verify credentials and open a session. Returns the session token.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(String, User), FlagError> {
        let email = email.trim().to_lowercase();
        let Some(stored_hash) = self.operators.get(&email).cloned() else {
            debug!(%email, "sign-in for unknown operator");
            return Err(FlagError::Unauthorized);
        };

        let password = password.to_string();
        let valid = tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
            .await
            .unwrap_or(false);
        if !valid {
            info!(%email, "sign-in rejected");
            return Err(FlagError::Unauthorized);
        }

        let token = generate_token();
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| s.expires_at > now);
        sessions.insert(
            token.clone(),
            SessionRecord {
                email: email.clone(),
                expires_at: now + self.ttl,
            },
        );
        info!(%email, "operator signed in");

        Ok((token, User { email }))
    }

    /// The operator a live session token belongs to.
    pub async fn resolve(&self, token: &str) -> Option<User> {
        let now = Instant::now();
        {
            let sessions = self.sessions.read().await;
            match sessions.get(token) {
                Some(s) if s.expires_at > now => {
                    return Some(User {
                        email: s.email.clone(),
                    })
                }
                Some(_) => {}
                None => return None,
            }
        }

        self.sessions.write().await.remove(token);
        debug!("session expired");
        None
    }

    pub async fn sign_out(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(email: &str, password: &str, ttl: Duration) -> SessionStore {
        let operators = vec![OperatorConfig {
            email: email.to_string(),
            password_hash: hash_password(password).unwrap(),
        }];
        SessionStore::new(&operators, ttl)
    }

    #[test]
    fn hash_round_trip_and_bad_hash() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "not-a-hash"));
    }

    #[test]
    fn tokens_are_url_safe_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn sign_in_resolve_sign_out() {
        let store = store_with("Ops@Example.com", "secret", Duration::from_secs(60));

        let (token, user) = store.sign_in(" ops@example.com ", "secret").await.unwrap();
        assert_eq!(user.email, "ops@example.com");
        assert_eq!(store.resolve(&token).await, Some(user));

        assert!(store.sign_out(&token).await);
        assert_eq!(store.resolve(&token).await, None);
        assert!(!store.sign_out(&token).await);
    }

    #[tokio::test]
    async fn wrong_password_or_unknown_operator_is_unauthorized() {
        let store = store_with("ops@example.com", "secret", Duration::from_secs(60));
        assert_eq!(
            store.sign_in("ops@example.com", "wrong").await,
            Err(FlagError::Unauthorized)
        );
        assert_eq!(
            store.sign_in("nobody@example.com", "secret").await,
            Err(FlagError::Unauthorized)
        );
    }

    #[tokio::test]
    async fn expired_sessions_do_not_resolve() {
        let store = store_with("ops@example.com", "secret", Duration::ZERO);
        let (token, _) = store.sign_in("ops@example.com", "secret").await.unwrap();
        assert_eq!(store.resolve(&token).await, None);
    }
}
