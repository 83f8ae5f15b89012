//! Optional password check against configured SHA-256 digests.

use hotline_settings::AuthSettings;
use sha2::{Digest, Sha256};

use crate::directory::Role;

/// Lowercase hex SHA-256 of `password`.
pub fn digest(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Whether `password` is acceptable for `account`.
///
/// Accounts with no configured digest accept any password.
pub fn verify(settings: &AuthSettings, role: Role, account: &str, password: &str) -> bool {
    let table = match role {
        Role::Staffer => &settings.staffers,
        Role::User => &settings.users,
    };
    match table.get(account) {
        Some(expected) => expected.eq_ignore_ascii_case(&digest(password)),
        None => true,
    }
}
