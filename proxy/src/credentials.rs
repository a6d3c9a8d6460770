//! Parsing and rotation of preauthenticated Smithery session credentials.
use std::sync::{Arc, Mutex};

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use crate::Error;

/// The Supabase project ref used by the upstream auth cookie name.
const PROJECT_REF: &str = "spjawbfpwezjfmicopsl";

/// The session blob as exported from a logged-in browser session.
#[derive(Deserialize, Debug)]
struct RawSessionToken {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
    #[serde(default)]
    expires_at: i64,
    #[serde(default)]
    user: Option<serde_json::Value>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

fn default_expires_in() -> u64 {
    3600
}

/// The subset of the session blob that the upstream auth cookie actually carries.
#[derive(Serialize)]
struct CookieToken<'a> {
    access_token: &'a str,
    refresh_token: Option<&'a str>,
    token_type: &'a str,
    expires_in: u64,
    expires_at: i64,
    user: Option<&'a serde_json::Value>,
}

/// One parsed session credential. Immutable once constructed; the pool owns
/// every instance and hands out `Arc` clones on checkout.
#[derive(Clone)]
pub struct Credential {
    name: String,
    masked_email: Option<String>,
    expires_at: i64,
    cookie_header: String,
}

impl Credential {
    /// Parse a raw session JSON blob into a credential. Fails if the blob is
    /// not JSON or carries no access token.
    pub fn from_json(raw: &str, name: impl Into<String>) -> Result<Self, Report<Error>> {
        let name = name.into();
        let token: RawSessionToken = serde_json::from_str(raw)
            .change_context_lazy(|| Error::InvalidCredential(name.clone()))
            .attach_printable("Session blob is not valid JSON")?;

        if token.access_token.is_empty() {
            return Err(Report::new(Error::InvalidCredential(name))
                .attach_printable("Session blob is missing 'access_token'"));
        }

        let masked_email = token
            .user
            .as_ref()
            .and_then(|user| user.get("email"))
            .and_then(|email| email.as_str())
            .and_then(mask_email);

        let cookie_value = serde_json::to_string(&CookieToken {
            access_token: &token.access_token,
            refresh_token: token.refresh_token.as_deref(),
            token_type: &token.token_type,
            expires_in: token.expires_in,
            expires_at: token.expires_at,
            user: token.user.as_ref(),
        })
        .change_context_lazy(|| Error::InvalidCredential(name.clone()))?;

        Ok(Self {
            name,
            masked_email,
            expires_at: token.expires_at,
            cookie_header: format!("sb-{PROJECT_REF}-auth-token={cookie_value}"),
        })
    }

    /// The label for this credential, usually the environment variable it was
    /// loaded from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The account email with the middle of the local part masked out.
    pub fn masked_email(&self) -> Option<&str> {
        self.masked_email.as_deref()
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// The full `Cookie` header value for an upstream request.
    pub fn cookie_header(&self) -> &str {
        &self.cookie_header
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("masked_email", &self.masked_email)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Mask an email address as `ab**cd@domain`. The first and last two
/// characters of the local part stay visible; the domain is untouched.
/// Returns `None` for anything that does not look like an email.
pub fn mask_email(email: &str) -> Option<String> {
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }

    let chars: Vec<char> = local.chars().collect();
    let mut prefix: String = chars.iter().take(2).collect();
    while prefix.chars().count() < 2 {
        prefix.push('x');
    }

    let suffix: String = if chars.len() >= 2 {
        chars[chars.len() - 2..].iter().collect()
    } else {
        format!("{}x", chars[0])
    };

    Some(format!("{prefix}**{suffix}@{domain}"))
}

/// Round-robin distributor over the configured credentials.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Arc<Credential>>,
    cursor: Mutex<usize>,
}

impl CredentialPool {
    /// Build a pool. An empty credential list is a configuration error, not a
    /// runtime condition; the process must not start without one.
    pub fn new(credentials: Vec<Credential>) -> Result<Self, Error> {
        if credentials.is_empty() {
            return Err(Error::NoCredentials);
        }

        Ok(Self {
            credentials: credentials.into_iter().map(Arc::new).collect(),
            cursor: Mutex::new(0),
        })
    }

    /// Check out the next credential. Call k returns position `k mod N`; the
    /// cursor update is a plain mutex so checkout never suspends and
    /// concurrent callers see one global sequence.
    pub fn checkout(&self) -> (Arc<Credential>, usize) {
        let mut cursor = self.cursor.lock().unwrap();
        let index = *cursor;
        *cursor = (index + 1) % self.credentials.len();
        (self.credentials[index].clone(), index)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// All credentials in configuration order, for usage breakdowns keyed by
    /// credential index.
    pub fn credentials(&self) -> &[Arc<Credential>] {
        &self.credentials
    }
}
