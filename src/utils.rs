// ABOUTME: Utility functions for identifier validation, SQL quoting and URL handling
// ABOUTME: Every table/column name that reaches dynamic SQL passes through here

use anyhow::{bail, Result};

/// PostgreSQL truncates names beyond NAMEDATALEN - 1 bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that a name can be spliced into generated SQL unquoted.
///
/// Table names, primary keys, priority fields and the follower id all end up
/// inside trigger bodies, status-table names and DDL. Accepted: an ASCII
/// letter or underscore followed by up to 62 letters, digits or underscores.
///
/// # Examples
///
/// ```
/// # use trigger_replicator::utils::validate_identifier;
/// assert!(validate_identifier("orders").is_ok());
/// assert!(validate_identifier("_audit_2024").is_ok());
/// assert!(validate_identifier("1orders").is_err());
/// assert!(validate_identifier("orders; DROP TABLE x").is_err());
/// ```
pub fn validate_identifier(name: &str) -> Result<()> {
    let name = name.trim();
    let Some(first) = name.chars().next() else {
        bail!("name is empty");
    };
    if name.len() > MAX_IDENTIFIER_LEN {
        bail!(
            "name '{}' is {} bytes long, the limit is {}",
            printable(name),
            name.len(),
            MAX_IDENTIFIER_LEN
        );
    }
    if !(first == '_' || first.is_ascii_alphabetic()) {
        bail!("name '{}' must begin with a letter or '_'", printable(name));
    }
    if let Some((pos, bad)) = name
        .char_indices()
        .find(|(_, c)| !(*c == '_' || c.is_ascii_alphanumeric()))
    {
        bail!(
            "name '{}' has {} at byte {}; only ASCII letters, digits and '_' are accepted",
            printable(name),
            bad.escape_debug(),
            pos
        );
    }
    Ok(())
}

// Drops control characters and caps length so a rejected name can go into an error.
fn printable(name: &str) -> String {
    name.chars().filter(|c| !c.is_control()).take(100).collect()
}

fn wrap(value: &str, delimiter: char) -> String {
    let doubled: String = [delimiter, delimiter].iter().collect();
    format!(
        "{d}{}{d}",
        value.replace(delimiter, &doubled),
        d = delimiter
    )
}

/// Double-quote an identifier for PostgreSQL.
pub fn quote_ident(name: &str) -> String {
    wrap(name, '"')
}

/// Single-quote a string literal for PostgreSQL.
///
/// ```
/// use trigger_replicator::utils::quote_literal;
/// assert_eq!(quote_literal("it's"), "'it''s'");
/// ```
pub fn quote_literal(value: &str) -> String {
    wrap(value, '\'')
}

/// Comma-separated list of quoted identifiers, for column lists.
pub fn quote_ident_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|name| quote_ident(name.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Mask the password of a connection URL before it is logged.
pub fn sanitize_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

/// Require a `postgres://` or `postgresql://` URL that names a database.
pub fn validate_connection_string(url: &str) -> Result<()> {
    if url.trim().is_empty() {
        bail!("connection URL is empty");
    }
    let parsed = match url::Url::parse(url) {
        Ok(parsed) => parsed,
        Err(e) => bail!("'{}' is not a URL: {}", sanitize_url(url), e),
    };
    if !matches!(parsed.scheme(), "postgres" | "postgresql") {
        bail!(
            "'{}' uses scheme '{}', expected postgres:// or postgresql://",
            sanitize_url(url),
            parsed.scheme()
        );
    }
    if parsed.path().trim_start_matches('/').is_empty() {
        bail!("'{}' does not name a database", sanitize_url(url));
    }
    Ok(())
}
