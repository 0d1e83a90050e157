//! Identity of the user driving the run.
//!
//! The user name scopes the cluster name handed to every node and salts the
//! content hash of uploaded artifacts, so concurrent users sharing hosts
//! neither join each other's clouds nor overwrite each other's uploads.

use std::env;

use nix::unistd::{User, getuid};

const FALLBACK_USER: &str = "unknown";

/// Returns the name of the user running this process.
///
/// Looks the current uid up in the OS user database and falls back to the
/// `USER` and `LOGNAME` environment variables.
#[must_use]
pub fn invoking_user() -> String {
    if let Ok(Some(user)) = User::from_uid(getuid()) {
        return user.name;
    }

    ["USER", "LOGNAME"]
        .iter()
        .find_map(|key| env::var(key).ok().filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| FALLBACK_USER.to_owned())
}

/// Builds the run-scoped cloud name `<prefix>-<user>`.
#[must_use]
pub fn cloud_name(prefix: &str, user: &str) -> String {
    format!("{prefix}-{user}")
}
