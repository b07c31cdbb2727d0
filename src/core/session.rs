//! Authentication state against the remote nutrition service.
//!
//! The service sets an auth cookie on login. When that cookie is visible we keep
//! its value as a token; when it is not (HttpOnly tricks, renamed cookie, ...)
//! we keep the whole cookie-bearing HTTP client and reuse it for later requests.
//!
//! **Used by**: orchestrator (login / invalidate), analysis client (credential).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info};
use reqwest::blocking::Client;
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::outcome::RequestOutcome;

/// Name of the auth cookie issued by the service
pub const AUTH_COOKIE: &str = "nutritrack_auth_token";

/// Timeout for the login request
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Proof of authentication. Exactly one form is active at a time.
#[derive(Clone)]
pub enum Credential {
    /// Value of the [`AUTH_COOKIE`] cookie
    Token(String),
    /// Cookie-storing client returned by login, reused as-is
    Session(Client),
}

impl Credential {
    pub fn is_session(&self) -> bool {
        matches!(self, Credential::Session(_))
    }

    /// HTTP client that carries this credential to `api_base`.
    ///
    /// Session credentials hand back their own client. Tokens get a fresh client
    /// whose cookie jar holds the token, scoped to the API host.
    pub fn client_for(&self, api_base: &str) -> Result<Client, String> {
        match self {
            Credential::Session(client) => Ok(client.clone()),
            Credential::Token(token) => {
                let host = api_host(api_base);
                if host.is_empty() {
                    return Err(format!("Cannot derive API host from '{}'", api_base));
                }
                let scheme = if api_base.starts_with("https://") { "https" } else { "http" };
                let url = reqwest::Url::parse(&format!("{}://{}/", scheme, host))
                    .map_err(|e| format!("Invalid API URL '{}': {}", api_base, e))?;

                let jar = Arc::new(Jar::default());
                jar.add_cookie_str(&format!("{}={}; Path=/", AUTH_COOKIE, token), &url);

                Client::builder()
                    .cookie_provider(jar)
                    .build()
                    .map_err(|e| format!("Failed to build HTTP client: {}", e))
            }
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Never print the token itself
            Credential::Token(token) => write!(f, "Token(<{} chars>)", token.len()),
            Credential::Session(_) => write!(f, "Session"),
        }
    }
}

/// Who we are logged in as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: Option<String>,
    pub display_name: String,
}

/// Credential + identity, always set and cleared together
#[derive(Debug, Clone)]
pub struct AuthState {
    pub credential: Credential,
    pub identity: UserIdentity,
    /// Bumped on every successful login
    pub generation: u64,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    user: Option<LoginUser>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct LoginUser {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Owns the authentication state; shared with workers via `Arc`.
#[derive(Default)]
pub struct SessionManager {
    state: RwLock<Option<AuthState>>,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single login attempt. Stored state changes on success only.
    pub fn login(&self, base_url: &str, email: &str, password: &str) -> RequestOutcome<AuthState> {
        let url = format!("{}/auth/login", base_url.trim_end_matches('/'));
        info!("Logging in as {}...", email);

        let client = match Client::builder()
            .cookie_store(true)
            .timeout(LOGIN_TIMEOUT)
            .build()
        {
            Ok(c) => c,
            Err(e) => return RequestOutcome::transport(&e),
        };

        let response = match client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(&LoginRequest { email, password })
            .send()
        {
            Ok(r) => r,
            Err(e) => return RequestOutcome::transport(&e),
        };

        let status = response.status();
        // Cookies must be read before the body consumes the response
        let cookies: Vec<(String, String)> = response
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        let body = match response.text() {
            Ok(b) => b,
            Err(e) => return RequestOutcome::transport(&e),
        };

        if status != StatusCode::OK {
            info!("Login failed with status code: {}", status.as_u16());
            return RequestOutcome::client_error(status.as_u16(), &body);
        }

        let parsed: LoginResponse = match serde_json::from_str(&body) {
            Ok(p) => p,
            Err(e) => return RequestOutcome::DecodeFailure(e.to_string()),
        };

        if !parsed.success {
            return RequestOutcome::ClientError {
                status: status.as_u16(),
                message: parsed.message.unwrap_or_else(|| "Unknown error".to_string()),
            };
        }

        debug!(
            "All cookies: {:?}",
            cookies.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>()
        );

        let credential = match cookies.into_iter().find(|(name, _)| name == AUTH_COOKIE) {
            Some((_, value)) => {
                info!("Authentication token retrieved from cookies");
                Credential::Token(value)
            }
            None => {
                info!("Token not found in cookies, using session-based authentication instead");
                Credential::Session(client)
            }
        };

        let user = parsed.user.unwrap_or(LoginUser { id: None, name: None });
        let identity = UserIdentity {
            id: user.id.and_then(json_id),
            display_name: user.name.unwrap_or_else(|| email.to_string()),
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let auth = AuthState { credential, identity, generation };
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = Some(auth.clone());

        info!("Login successful! Welcome, {}", auth.identity.display_name);
        RequestOutcome::Success(auth)
    }

    /// Clear credential and identity. Returns true if anything was cleared.
    pub fn invalidate(&self) -> bool {
        let cleared = self.state.write().unwrap_or_else(|e| e.into_inner()).take().is_some();
        if cleared {
            info!("Session invalidated");
        }
        cleared
    }

    /// Clear only if the state still belongs to login `generation`.
    ///
    /// A 401 on a request issued before a newer login must not log the user out
    /// of the newer session.
    pub fn invalidate_generation(&self, generation: u64) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state.as_ref() {
            Some(auth) if auth.generation == generation => {
                *state = None;
                info!("Session invalidated");
                true
            }
            _ => false,
        }
    }

    pub fn current_credential(&self) -> Option<Credential> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.credential.clone())
    }

    pub fn identity(&self) -> Option<UserIdentity> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.identity.clone())
    }

    /// Full snapshot (credential + identity + generation)
    pub fn snapshot(&self) -> Option<AuthState> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

/// Host part of an API base URL: scheme and path stripped, port kept.
///
/// `https://example.app/v1` -> `example.app`
pub fn api_host(api_base: &str) -> String {
    let rest = match api_base.split_once("//") {
        Some((_, rest)) => rest,
        None => api_base,
    };
    rest.split('/').next().unwrap_or("").to_string()
}

fn json_id(v: serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
