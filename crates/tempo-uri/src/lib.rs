//! Calendar resource URI grammar and resolution for Tempo.
//!
//! Canonical grammar: `scheme "://" [ account "/" ] namespace "/" identifier`
//! with `scheme` ∈ {`msgraph`, `local`} and `namespace` ∈ {`calendars`}.
//! Identifiers may be technical ids, percent-encoded names, double-quoted
//! names, backslash-escaped names, or the literal `primary`. Legacy URIs
//! (no namespace, no account) are migrated to the canonical grammar on read
//! and never written back in legacy form.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;
use tempo_proto::User;
use tracing::{debug, warn};

/// Matches Python's `urllib.parse.quote(name, safe='')`: letters, digits and
/// `_ . - ~` pass through, everything else is escaped.
const IDENTIFIER_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~');

pub const SCHEME_MSGRAPH: &str = "msgraph";
pub const SCHEME_LOCAL: &str = "local";
pub const NAMESPACE_CALENDARS: &str = "calendars";
pub const PRIMARY_IDENTIFIER: &str = "primary";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// User-facing configuration problems; never retried.
#[derive(Debug, thiserror::Error)]
pub enum UriError {
    #[error("URI parse error: {0}")]
    Parse(String),
    #[error("URI validation error: {0}")]
    Validation(String),
    #[error("calendar resolution error: {0}")]
    Resolution(String),
}

// ─── ParsedUri ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedUri {
    pub scheme: String,
    pub account: Option<String>,
    pub namespace: String,
    /// Decoded identifier (quotes, escapes, and percent-encoding removed).
    pub identifier: String,
    /// True when the identifier was written as a human-readable name rather
    /// than a technical id.
    pub is_friendly_name: bool,
}

// ─── Account validation ──────────────────────────────────────────────────────

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)+$").expect("email regex")
});
static DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)+$").expect("domain regex"));
static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").expect("username regex"));

/// Syntactic validity of an account segment: an email address, a domain,
/// a numeric user id, or a plain username.
pub fn validate_account(account: &str) -> bool {
    if account.is_empty() {
        return false;
    }
    if account.contains('@') {
        return EMAIL_RE.is_match(account);
    }
    DOMAIN_RE.is_match(account) || USERNAME_RE.is_match(account)
}

// ─── Component validation ────────────────────────────────────────────────────

pub fn validate_uri_components(
    scheme: &str,
    namespace: &str,
    identifier: Option<&str>,
) -> Result<(), UriError> {
    if scheme != SCHEME_MSGRAPH && scheme != SCHEME_LOCAL {
        return Err(UriError::Validation(format!(
            "unsupported scheme '{scheme}'"
        )));
    }
    if namespace != NAMESPACE_CALENDARS {
        return Err(UriError::Validation(format!(
            "unsupported namespace '{namespace}'"
        )));
    }
    if let Some(identifier) = identifier {
        if identifier.is_empty() {
            return Err(UriError::Validation("empty identifier".to_string()));
        }
    }
    Ok(())
}

// ─── User-friendly identifiers ───────────────────────────────────────────────

/// Strip the user-friendly decorations from an identifier: optional
/// `Calendar: ` prefix, double or single quotes, and backslash escapes.
pub fn parse_user_friendly_identifier(raw: &str) -> String {
    let mut value = raw.trim();
    if let Some(stripped) = value.strip_prefix("Calendar:") {
        value = stripped.trim_start();
    }
    let value = value.to_string();
    let unquoted = if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
        || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
    {
        value[1..value.len() - 1].to_string()
    } else {
        value
    };
    unquoted.replace("\\ ", " ")
}

/// Render an identifier in its user-friendly form: names with spaces are
/// double-quoted, others are left bare unless quoting is forced.
pub fn format_user_friendly_identifier(
    name: &str,
    force_quotes: bool,
    use_calendar_prefix: bool,
) -> String {
    let quoted = if force_quotes || name.contains(char::is_whitespace) {
        format!("\"{name}\"")
    } else {
        name.to_string()
    };
    if use_calendar_prefix {
        format!("Calendar: {quoted}")
    } else {
        quoted
    }
}

// ─── Parse ───────────────────────────────────────────────────────────────────

/// Parse a canonical resource URI.
///
/// Empty input and the bare legacy shortcuts `calendar` / `primary` resolve
/// to the primary calendar. Anything else must follow the canonical grammar;
/// legacy forms are handled by [`migrate_legacy_uri`].
pub fn parse_resource_uri(uri: &str) -> Result<ParsedUri, UriError> {
    let uri = uri.trim();
    if uri.is_empty() || uri == "calendar" || uri == PRIMARY_IDENTIFIER {
        return Ok(ParsedUri {
            scheme: SCHEME_MSGRAPH.to_string(),
            account: None,
            namespace: NAMESPACE_CALENDARS.to_string(),
            identifier: PRIMARY_IDENTIFIER.to_string(),
            is_friendly_name: false,
        });
    }

    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| UriError::Parse(format!("missing scheme in URI '{uri}'")))?;
    if scheme.is_empty() {
        return Err(UriError::Parse(format!("missing scheme in URI '{uri}'")));
    }
    if rest.contains("://") {
        return Err(UriError::Parse(format!("duplicate '://' in URI '{uri}'")));
    }
    if rest.is_empty() || rest == "/" {
        return Err(UriError::Parse(format!("missing path in URI '{uri}'")));
    }

    // `scheme:///namespace/identifier` is the explicit no-account form.
    let path = rest.strip_prefix('/').unwrap_or(rest);
    if path.contains("//") {
        return Err(UriError::Parse(format!("double slash in URI '{uri}'")));
    }

    let segments: Vec<&str> = path.split('/').collect();
    let (account, namespace, identifier_raw) = match segments.as_slice() {
        [namespace, identifier] => (None, *namespace, *identifier),
        [account, namespace, identifier] => (Some(*account), *namespace, *identifier),
        _ => {
            return Err(UriError::Parse(format!(
                "expected [account/]namespace/identifier in URI '{uri}'"
            )))
        }
    };

    if let Some(account) = account {
        if !validate_account(account) {
            return Err(UriError::Parse(format!(
                "invalid account '{account}' in URI '{uri}'"
            )));
        }
    }
    if namespace != NAMESPACE_CALENDARS {
        return Err(UriError::Parse(format!(
            "unknown namespace '{namespace}' in URI '{uri}'"
        )));
    }
    if identifier_raw.is_empty() {
        return Err(UriError::Parse(format!("empty identifier in URI '{uri}'")));
    }

    let unescaped = parse_user_friendly_identifier(identifier_raw);
    let decoded = percent_decode_str(&unescaped)
        .decode_utf8()
        .map(|c| c.into_owned())
        .unwrap_or(unescaped.clone());
    let is_friendly_name = if is_primary_alias(&decoded) {
        false
    } else {
        decoded != identifier_raw
            || decoded.contains(char::is_whitespace)
            || !looks_like_technical_id(&decoded)
    };

    Ok(ParsedUri {
        scheme: scheme.to_string(),
        account: account.map(str::to_string),
        namespace: namespace.to_string(),
        identifier: decoded,
        is_friendly_name,
    })
}

// ─── Construct ───────────────────────────────────────────────────────────────

/// Build a canonical resource URI. `user_friendly` selects quoted names over
/// percent-encoding for identifiers that need escaping.
pub fn construct_resource_uri(
    scheme: &str,
    namespace: &str,
    identifier: &str,
    user_friendly: bool,
    account: Option<&str>,
) -> Result<String, UriError> {
    validate_uri_components(scheme, namespace, Some(identifier))?;
    if let Some(account) = account {
        if !validate_account(account) {
            return Err(UriError::Validation(format!("invalid account '{account}'")));
        }
    }

    let rendered = if user_friendly {
        format_user_friendly_identifier(identifier, false, false)
    } else {
        utf8_percent_encode(identifier, IDENTIFIER_ENCODE_SET).to_string()
    };

    Ok(match account {
        Some(account) => format!("{scheme}://{account}/{namespace}/{rendered}"),
        None => format!("{scheme}://{namespace}/{rendered}"),
    })
}

/// Percent-encoded variant, for persistence.
pub fn construct_resource_uri_encoded(
    scheme: &str,
    namespace: &str,
    identifier: &str,
    account: Option<&str>,
) -> Result<String, UriError> {
    construct_resource_uri(scheme, namespace, identifier, false, account)
}

/// The canonical URI of a user's primary calendar.
pub fn get_primary_calendar_uri(scheme: &str, account: Option<&str>) -> String {
    match account {
        Some(account) => format!("{scheme}://{account}/{NAMESPACE_CALENDARS}/{PRIMARY_IDENTIFIER}"),
        None => format!("{scheme}://{NAMESPACE_CALENDARS}/{PRIMARY_IDENTIFIER}"),
    }
}

/// Re-render a URI with a percent-encoded identifier.
pub fn convert_uri_to_encoded(uri: &str) -> Result<String, UriError> {
    let parsed = parse_resource_uri(uri)?;
    construct_resource_uri(
        &parsed.scheme,
        &parsed.namespace,
        &parsed.identifier,
        false,
        parsed.account.as_deref(),
    )
}

/// Re-render a URI with a user-friendly identifier.
pub fn convert_uri_to_user_friendly(uri: &str) -> Result<String, UriError> {
    let parsed = parse_resource_uri(uri)?;
    construct_resource_uri(
        &parsed.scheme,
        &parsed.namespace,
        &parsed.identifier,
        true,
        parsed.account.as_deref(),
    )
}

// ─── Lookup normalization ────────────────────────────────────────────────────

/// Normalize a calendar name for case- and punctuation-insensitive matching:
/// lowercase, trimmed, punctuation dropped, whitespace collapsed.
pub fn normalize_calendar_name_for_lookup(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let cleaned: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '_'))
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The hyphenated lookup key used by legacy URIs: lowercase, whitespace to
/// single hyphens, everything outside `[a-z0-9-_]` dropped.
pub fn create_legacy_compatible_lookup_key(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let hyphenated = lowered.split_whitespace().collect::<Vec<_>>().join("-");
    hyphenated
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_'))
        .collect()
}

// ─── Legacy migration ────────────────────────────────────────────────────────

/// Migrate a legacy URI (no namespace, no account) to the canonical grammar.
/// Already-canonical URIs pass through unchanged.
pub fn migrate_legacy_uri(uri: &str, account: Option<&str>) -> String {
    if parse_resource_uri(uri).is_ok() {
        return uri.to_string();
    }

    let Some((scheme, rest)) = uri.split_once("://") else {
        // A bare name: treat as a legacy msgraph identifier.
        return match account {
            Some(account) => format!("{SCHEME_MSGRAPH}://{account}/{NAMESPACE_CALENDARS}/{uri}"),
            None => format!("{SCHEME_MSGRAPH}://{NAMESPACE_CALENDARS}/{uri}"),
        };
    };

    let identifier = rest.trim_matches('/');
    let identifier = if identifier.is_empty() || identifier == "calendar" {
        PRIMARY_IDENTIFIER
    } else {
        identifier
    };
    match account {
        Some(account) => format!("{scheme}://{account}/{NAMESPACE_CALENDARS}/{identifier}"),
        None => format!("{scheme}://{NAMESPACE_CALENDARS}/{identifier}"),
    }
}

/// Parse a URI, migrating legacy forms when strict parsing fails.
pub fn parse_or_migrate(uri: &str, account: Option<&str>) -> Result<ParsedUri, UriError> {
    match parse_resource_uri(uri) {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            debug!(uri, "strict parse failed, attempting legacy migration");
            parse_resource_uri(&migrate_legacy_uri(uri, account))
        }
    }
}

// ─── Calendar directory & resolver ───────────────────────────────────────────

/// One calendar as reported by a backend's calendar listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// Backend listing of a user's calendars. Implemented by the remote graph
/// client and by in-memory fixtures in tests.
#[async_trait]
pub trait CalendarDirectory: Send + Sync {
    async fn list_calendars(&self, user: &User) -> Result<Vec<CalendarInfo>, UriError>;
}

/// A calendar with its canonical URI, for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarUriInfo {
    pub name: String,
    pub uri: String,
    pub is_primary: bool,
    pub scheme: String,
}

/// Resolves calendar URIs to backend calendar ids.
pub struct CalendarResolver {
    directory: std::sync::Arc<dyn CalendarDirectory>,
    cache: Mutex<HashMap<i64, Vec<CalendarInfo>>>,
}

impl CalendarResolver {
    pub fn new(directory: std::sync::Arc<dyn CalendarDirectory>) -> Self {
        Self {
            directory,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a calendar URI (canonical or legacy) to the backend id.
    ///
    /// For `msgraph`, the primary calendar resolves to the empty backend id.
    /// Friendly names are matched against the user's calendar list by exact,
    /// normalized, then legacy-hyphenated key; an unmatched name falls back
    /// to the identifier verbatim with a warning.
    pub async fn resolve(&self, uri: &str, user: &User) -> Result<String, UriError> {
        if uri.trim().is_empty() {
            return Ok(String::new());
        }
        let parsed = parse_or_migrate(uri, None)?;

        if let Some(account) = &parsed.account {
            validate_account_context(user, account)?;
        }
        if parsed.namespace != NAMESPACE_CALENDARS {
            return Err(UriError::Resolution(format!(
                "unsupported namespace '{}' for calendar URI '{uri}'",
                parsed.namespace
            )));
        }

        match parsed.scheme.as_str() {
            SCHEME_MSGRAPH => self.resolve_msgraph(&parsed, user).await,
            SCHEME_LOCAL => Ok(resolve_local(&parsed)),
            other => Err(UriError::Resolution(format!(
                "unsupported scheme '{other}' for calendar URI '{uri}'"
            ))),
        }
    }

    async fn resolve_msgraph(&self, parsed: &ParsedUri, user: &User) -> Result<String, UriError> {
        if !parsed.is_friendly_name {
            if is_primary_alias(&parsed.identifier) {
                // The empty backend id addresses the primary calendar.
                return Ok(String::new());
            }
            debug!(identifier = %parsed.identifier, "technical id, using as-is");
            return Ok(parsed.identifier.clone());
        }

        let calendars = self.calendars_for(user).await?;

        if let Some(cal) = calendars.iter().find(|c| c.name == parsed.identifier) {
            debug!(name = %parsed.identifier, id = %cal.id, "resolved via exact match");
            return Ok(cal.id.clone());
        }

        let target = normalize_calendar_name_for_lookup(&parsed.identifier);
        if let Some(cal) = calendars
            .iter()
            .find(|c| normalize_calendar_name_for_lookup(&c.name) == target)
        {
            debug!(name = %parsed.identifier, id = %cal.id, "resolved via normalized match");
            return Ok(cal.id.clone());
        }

        let target = create_legacy_compatible_lookup_key(&parsed.identifier);
        if let Some(cal) = calendars
            .iter()
            .find(|c| create_legacy_compatible_lookup_key(&c.name) == target)
        {
            debug!(name = %parsed.identifier, id = %cal.id, "resolved via legacy match");
            return Ok(cal.id.clone());
        }

        if is_primary_alias(&parsed.identifier) {
            return Ok(String::new());
        }

        warn!(
            name = %parsed.identifier,
            "calendar not found in user's calendars, using identifier as-is"
        );
        Ok(parsed.identifier.clone())
    }

    async fn calendars_for(&self, user: &User) -> Result<Vec<CalendarInfo>, UriError> {
        if let Some(cached) = self.cache.lock().get(&user.id) {
            return Ok(cached.clone());
        }
        let calendars = self.directory.list_calendars(user).await?;
        self.cache.lock().insert(user.id, calendars.clone());
        Ok(calendars)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// List the user's calendars with their canonical user-friendly URIs.
    pub async fn list_available_calendars(
        &self,
        user: &User,
    ) -> Result<Vec<CalendarUriInfo>, UriError> {
        let calendars = self.calendars_for(user).await?;
        calendars
            .into_iter()
            .map(|cal| {
                let uri = if cal.is_default {
                    get_primary_calendar_uri(SCHEME_MSGRAPH, None)
                } else {
                    construct_resource_uri(
                        SCHEME_MSGRAPH,
                        NAMESPACE_CALENDARS,
                        &cal.name,
                        true,
                        None,
                    )?
                };
                Ok(CalendarUriInfo {
                    name: cal.name,
                    uri,
                    is_primary: cal.is_default,
                    scheme: SCHEME_MSGRAPH.to_string(),
                })
            })
            .collect()
    }
}

fn is_primary_alias(identifier: &str) -> bool {
    identifier.is_empty() || identifier == PRIMARY_IDENTIFIER || identifier == "calendar"
}

/// Provider-assigned calendar ids are long base64 blobs; anything shorter is
/// assumed to be a name the user typed.
fn looks_like_technical_id(identifier: &str) -> bool {
    identifier.len() > 50 && identifier.contains('=')
}

fn resolve_local(parsed: &ParsedUri) -> String {
    // Local identifiers are already ids or names understood by the store.
    parsed.identifier.clone()
}

/// Enforce that a URI's account context belongs to the invoking user: email
/// (case-insensitive), username (case-sensitive), or numeric id. An absent
/// account is legacy-compatible and not validated.
pub fn validate_account_context(user: &User, account: &str) -> Result<(), UriError> {
    let account = account.trim();
    if account.is_empty() {
        return Ok(());
    }

    if let Some(email) = &user.email {
        if account.eq_ignore_ascii_case(email) {
            return Ok(());
        }
    }
    if let Some(username) = &user.username {
        if account == username {
            return Ok(());
        }
    }
    if account == user.id.to_string() {
        return Ok(());
    }

    let mut expected = Vec::new();
    if let Some(email) = &user.email {
        expected.push(format!("email: {email}"));
    }
    if let Some(username) = &user.username {
        expected.push(format!("username: {username}"));
    }
    expected.push(format!("id: {}", user.id));

    warn!(account, "account context does not match the invoking user");
    Err(UriError::Resolution(format!(
        "account context mismatch: URI account '{account}' does not match the current user \
         (expected one of: {})",
        expected.join(", ")
    )))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
