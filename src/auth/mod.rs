//! Authentication and authorisation subsystem.
//!
//! Extracts session credentials from git client requests, resolves them to a
//! durable identity through the external [`directory::IdentityResolver`], and
//! decides access with the role-based [`resolver::PermissionResolver`].

pub mod directory;
pub mod resolver;

use axum::http::{header, HeaderMap};
use base64::Engine as _;

pub use directory::{Identity, IdentityResolver, Permission, RoleSource};
pub use resolver::PermissionResolver;

/// Session token carried by a git client request.
///
/// `Authorization: Bearer <session>` is taken as-is.  For
/// `Authorization: Basic`, the password is the session token and the username
/// is ignored, which is what stock git clients send after a credential prompt.
pub fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    let rest = rest.trim();

    if scheme.eq_ignore_ascii_case("bearer") {
        return (!rest.is_empty()).then(|| rest.to_string());
    }
    if scheme.eq_ignore_ascii_case("basic") {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(rest)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())?;
        let (_user, password) = decoded.split_once(':')?;
        return (!password.is_empty()).then(|| password.to_string());
    }
    None
}
