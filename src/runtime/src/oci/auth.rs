//! Registry authentication.
//!
//! A client starts [`AuthState::Unauthenticated`]. Its first request is sent
//! without credentials as a probe; a `WWW-Authenticate` challenge in the answer
//! is exchanged for a bearer token at the challenge realm. Anything that goes
//! wrong on the way degrades to anonymous access instead of failing the pull.

use std::collections::HashMap;

use boxroot_core::error::Result;
use serde::Deserialize;

use super::credentials::CredentialStore;
use super::transport::{HttpRequest, HttpTransport};

const ENV_USERNAME: &str = "REGISTRY_USERNAME";
const ENV_PASSWORD: &str = "REGISTRY_PASSWORD";

/// Credentials for a container registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// No credentials.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Basic credentials.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`; anonymous unless both are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        match (lookup(ENV_USERNAME), lookup(ENV_PASSWORD)) {
            (Some(u), Some(p)) if !u.is_empty() => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    /// Credential store entry for `registry`, then environment, then anonymous.
    pub fn resolve(registry: &str, store: &CredentialStore) -> Self {
        match store.lookup(registry) {
            Ok(Some((username, password))) => return Self::basic(username, password),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
            }
        }
        Self::from_env()
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.credentials().is_none()
    }
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic {
        realm: Option<String>,
    },
}

impl Challenge {
    /// Parse a challenge header value. Quoted values may contain commas.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = match header.split_once(char::is_whitespace) {
            Some((scheme, params)) => (scheme, params),
            None => (header, ""),
        };
        let params = parse_auth_params(params);

        if scheme.eq_ignore_ascii_case("bearer") {
            let realm = params.get("realm").filter(|r| !r.is_empty())?.clone();
            Some(Challenge::Bearer {
                realm,
                service: params.get("service").cloned(),
                scope: params.get("scope").cloned(),
            })
        } else if scheme.eq_ignore_ascii_case("basic") {
            Some(Challenge::Basic {
                realm: params.get("realm").cloned(),
            })
        } else {
            None
        }
    }

    /// Token endpoint URL for a bearer challenge.
    pub fn token_url(&self) -> Option<String> {
        match self {
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let query: Vec<String> = [("service", service), ("scope", scope)]
                    .into_iter()
                    .filter_map(|(key, value)| {
                        value.as_ref().map(|v| format!("{}={}", key, query_escape(v)))
                    })
                    .collect();
                if query.is_empty() {
                    Some(realm.clone())
                } else {
                    let sep = if realm.contains('?') { '&' } else { '?' };
                    Some(format!("{}{}{}", realm, sep, query.join("&")))
                }
            }
            Challenge::Basic { .. } => None,
        }
    }
}

/// `key=value` / `key="quoted, value"` pairs separated by commas. Keys are lowercased.
fn parse_auth_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            continue;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    other => value.push(other),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        let key = key.trim().to_ascii_lowercase();
        if !key.is_empty() {
            params.insert(key, value.trim().to_string());
        }
    }
    params
}

/// Escape the characters that would break a query string argument.
fn query_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ' ' => out.push_str("%20"),
            '&' => out.push_str("%26"),
            '#' => out.push_str("%23"),
            '+' => out.push_str("%2B"),
            other => out.push(other),
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Authentication progress of one client instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No request has been sent yet
    Unauthenticated,
    /// The probe returned a challenge that has not been answered yet
    ChallengeReceived(Challenge),
    /// A bearer token was obtained
    Tokenized(String),
    /// The registry asked for basic auth and credentials are available
    Basic,
    /// No usable challenge or token; requests go out without authorization
    AnonymousFallback,
}

/// Drives the challenge/token exchange and decorates requests.
#[derive(Debug)]
pub struct AuthNegotiator {
    auth: RegistryAuth,
    state: AuthState,
    timeout_secs: u64,
}

impl AuthNegotiator {
    pub fn new(auth: RegistryAuth) -> Self {
        Self {
            auth,
            state: AuthState::Unauthenticated,
            timeout_secs: 0,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn needs_probe(&self) -> bool {
        self.state == AuthState::Unauthenticated
    }

    /// Probe `url` without credentials and settle on an authorization mode.
    ///
    /// Only a transport failure of the probe itself is an error.
    pub fn negotiate(&mut self, transport: &dyn HttpTransport, url: &str) -> Result<()> {
        tracing::debug!(url, "Probing registry for authentication challenge");
        let probe = transport.execute(&HttpRequest::get(url).max_time(self.timeout_secs))?;

        let challenge = match probe.header("www-authenticate").and_then(Challenge::parse) {
            Some(challenge) => challenge,
            None => {
                if probe.header("www-authenticate").is_some() {
                    tracing::warn!(url, "Unsupported authentication challenge, continuing anonymously");
                } else {
                    tracing::debug!(url, status = probe.status, "No authentication challenge");
                }
                self.state = AuthState::AnonymousFallback;
                return Ok(());
            }
        };

        self.state = AuthState::ChallengeReceived(challenge.clone());
        self.state = match &challenge {
            Challenge::Bearer { .. } => match self.fetch_token(transport, &challenge) {
                Some(token) => {
                    tracing::info!("Obtained registry bearer token");
                    AuthState::Tokenized(token)
                }
                None => {
                    tracing::warn!("Failed to obtain bearer token, continuing anonymously");
                    AuthState::AnonymousFallback
                }
            },
            Challenge::Basic { .. } if !self.auth.is_anonymous() => AuthState::Basic,
            Challenge::Basic { .. } => {
                tracing::warn!("Registry requests basic auth but no credentials are configured");
                AuthState::AnonymousFallback
            }
        };
        Ok(())
    }

    fn fetch_token(&self, transport: &dyn HttpTransport, challenge: &Challenge) -> Option<String> {
        let url = challenge.token_url()?;
        let mut request = HttpRequest::get(&url).max_time(self.timeout_secs);
        if let Some((user, pass)) = self.auth.credentials() {
            request = request.basic_auth(user, pass);
        }

        let response = match transport.execute(&request) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Token request failed");
                return None;
            }
        };
        if response.status != 0 && !response.is_success() {
            tracing::warn!(url = %url, status = response.status, "Token endpoint refused request");
            return None;
        }

        match serde_json::from_str::<TokenResponse>(&response.body) {
            Ok(parsed) => parsed
                .token
                .or(parsed.access_token)
                .filter(|t| !t.is_empty()),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Token response is not valid JSON");
                None
            }
        }
    }

    /// Attach the negotiated authorization to a request.
    pub fn authorize(&self, request: HttpRequest) -> HttpRequest {
        match self.state {
            AuthState::Tokenized(ref token) => {
                request.header("Authorization", format!("Bearer {}", token))
            }
            AuthState::Basic => match self.auth.credentials() {
                Some((user, pass)) => request.basic_auth(user, pass),
                None => request,
            },
            _ => request,
        }
    }
}
