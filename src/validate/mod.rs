//! Input validation and environment projection
//!
//! Everything that arrives from the URL path or query string passes through
//! here before it can influence a child process: package identifiers, query
//! parameters, the projected environment delta, and extra CLI arguments.

use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{Error, NameRejection, Result};

/// Maximum accepted package identifier length.
pub const MAX_NAME_LEN: usize = 200;
/// Maximum query parameter key length; oversize keys are rejected.
pub const MAX_PARAM_KEY_LEN: usize = 100;
/// Maximum query parameter value length; oversize values are truncated.
pub const MAX_PARAM_VALUE_LEN: usize = 1000;
/// Maximum number of extra CLI argument tokens.
pub const MAX_EXTRA_ARGS: usize = 20;
/// Maximum length of a single extra CLI argument token.
pub const MAX_EXTRA_ARG_LEN: usize = 100;

/// Query key reserved for extra CLI arguments; never projected to env.
pub const ARGS_PARAM: &str = "args";

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '\'', '"', '\\',
];

static PACKAGE_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(@[a-z0-9~][a-z0-9._~-]*/)?[a-z0-9~][a-z0-9._~-]*$").expect("valid regex")
});

static REMOTE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(https?|wss?)://").expect("valid regex"));

/// npm packages that bridge stdio to a remote endpoint. Accepting one of
/// these would turn the gateway into an open relay.
const REMOTE_BRIDGE_PACKAGES: &[&str] = &["mcp-remote", "supergateway", "mcp-proxy"];

/// A validated package identifier decomposed into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPackage {
    /// Name including scope, without the version suffix
    pub full_name: String,
    /// Scope without the leading `@`, if any
    pub scope: Option<String>,
    /// Bare name without scope or version
    pub name: String,
    /// Version specifier; `latest` when not pinned
    pub version: String,
}

impl ParsedPackage {
    pub fn is_pinned(&self) -> bool {
        self.version != "latest"
    }
}

/// Validate a raw package identifier and return its canonical form.
///
/// The canonical form of an accepted identifier is the input itself; this
/// function only ever rejects, it never rewrites.
pub fn validate_package_identifier(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(Error::InvalidPackageName(NameRejection::Empty));
    }
    if raw.len() > MAX_NAME_LEN {
        return Err(Error::InvalidPackageName(NameRejection::TooLong));
    }
    // Remote servers are a distinct failure: callers must see -32026, not a
    // generic format rejection, so this check runs before the format gates.
    if is_remote_identifier(raw) {
        return Err(Error::RemoteServerNotSupported);
    }
    if raw.contains("..") || raw.contains("/./") || raw.contains('\\') {
        return Err(Error::InvalidPackageName(NameRejection::PathTraversal));
    }
    if contains_shell_metacharacters(raw) {
        return Err(Error::InvalidPackageName(NameRejection::ShellMetacharacters));
    }

    let (name_part, _version) = split_version(raw);
    if !PACKAGE_FORMAT.is_match(name_part) {
        return Err(Error::InvalidPackageName(NameRejection::InvalidFormat));
    }

    Ok(raw.to_string())
}

/// True if the identifier is a URL or a known stdio-to-remote bridge package.
pub fn is_remote_identifier(raw: &str) -> bool {
    if REMOTE_URL.is_match(raw) {
        return true;
    }
    if raw.ends_with("/sse") || raw.ends_with("/stdio") {
        return true;
    }
    let (name_part, _) = split_version(raw);
    REMOTE_BRIDGE_PACKAGES.contains(&name_part)
}

/// Split an identifier into name and optional version at the last `@` that
/// is not at position 0 (scoped names start with `@`).
fn split_version(raw: &str) -> (&str, Option<&str>) {
    match raw.rfind('@') {
        Some(0) | None => (raw, None),
        Some(idx) => (&raw[..idx], Some(&raw[idx + 1..])),
    }
}

/// Decompose a validated identifier. Must be called on accepted input only.
pub fn parse_package(canonical: &str) -> ParsedPackage {
    let (full_name, version) = split_version(canonical);
    let version = match version {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => "latest".to_string(),
    };

    let (scope, name) = match full_name.strip_prefix('@') {
        Some(rest) => match rest.split_once('/') {
            Some((scope, name)) => (Some(scope.to_string()), name.to_string()),
            None => (None, full_name.to_string()),
        },
        None => (None, full_name.to_string()),
    };

    ParsedPackage {
        full_name: full_name.to_string(),
        scope,
        name,
        version,
    }
}

/// Enforce the query-parameter key cap. Oversize values are not an error
/// here; they are truncated later, at projection.
pub fn validate_params(params: &BTreeMap<String, String>) -> Result<()> {
    for key in params.keys() {
        if key.len() > MAX_PARAM_KEY_LEN {
            return Err(Error::InvalidParams(format!(
                "query parameter key exceeds {} characters",
                MAX_PARAM_KEY_LEN
            )));
        }
    }
    Ok(())
}

/// Well-known query keys mapped to conventional environment variable names.
/// Consulted before the generic transliteration.
const ENV_ALIASES: &[(&str, &str)] = &[
    ("apiKey", "API_KEY"),
    ("openaiApiKey", "OPENAI_API_KEY"),
    ("anthropicApiKey", "ANTHROPIC_API_KEY"),
    ("googleApiKey", "GOOGLE_API_KEY"),
    ("githubToken", "GITHUB_TOKEN"),
    ("gitlabToken", "GITLAB_TOKEN"),
    ("slackToken", "SLACK_TOKEN"),
    ("notionToken", "NOTION_TOKEN"),
    ("awsAccessKeyId", "AWS_ACCESS_KEY_ID"),
    ("awsSecretAccessKey", "AWS_SECRET_ACCESS_KEY"),
    ("awsRegion", "AWS_REGION"),
    ("databaseUrl", "DATABASE_URL"),
    ("braveApiKey", "BRAVE_API_KEY"),
];

/// Project query parameters onto a child environment delta.
///
/// The reserved `args` key is skipped. Keys that cannot be turned into a
/// valid environment variable name are dropped and logged. Values are
/// truncated to the cap and scrubbed of shell metacharacters.
pub fn project_environment(params: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut env = Vec::new();

    for (key, value) in params {
        if key == ARGS_PARAM {
            continue;
        }

        let Some(env_key) = env_key_for(key) else {
            warn!(key = %key, "dropping query parameter that cannot name an env var");
            continue;
        };

        env.push((env_key, scrub_value(value)));
    }

    env
}

fn env_key_for(key: &str) -> Option<String> {
    if let Some((_, alias)) = ENV_ALIASES.iter().find(|(k, _)| *k == key) {
        return Some((*alias).to_string());
    }

    let translit: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_ascii_uppercase();

    match translit.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => Some(translit),
        _ => None,
    }
}

fn scrub_value(value: &str) -> String {
    let truncated: String = value.chars().take(MAX_PARAM_VALUE_LEN).collect();
    truncated
        .chars()
        .filter(|c| !SHELL_METACHARACTERS.contains(c))
        .collect()
}

/// Parse the reserved `args` query parameter into CLI argument tokens.
///
/// The value is URL-decoded and split on spaces. Empty tokens are discarded,
/// the token list is capped, and every token is length-capped. Any shell
/// metacharacter anywhere in the decoded string rejects the whole list.
pub fn build_extra_args(raw: &str) -> Result<Vec<String>> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| Error::InvalidArgs("not valid UTF-8".to_string()))?;

    if contains_shell_metacharacters(&decoded) {
        return Err(Error::InvalidArgs("dangerous characters".to_string()));
    }

    let args = decoded
        .split(' ')
        .filter(|token| !token.is_empty())
        .take(MAX_EXTRA_ARGS)
        .map(|token| token.chars().take(MAX_EXTRA_ARG_LEN).collect())
        .collect();

    Ok(args)
}

pub fn contains_shell_metacharacters(s: &str) -> bool {
    s.chars().any(|c| SHELL_METACHARACTERS.contains(&c))
}
