//! Share codes let other users join a public group challenge by typing a short token.

use db::models::challenge::Challenge;
use rand::Rng;
use sqlx::SqlitePool;
use tracing::warn;

pub const SHARE_CODE_LEN: usize = 6;
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Candidates tried before giving up, both for the lookup here and for inserts that still collide
pub const MAX_ATTEMPTS: usize = 5;

pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..SHARE_CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Trim and upper-case user input; `None` when it cannot be a share code at all
pub fn normalize(input: &str) -> Option<String> {
    let code = input.trim().to_ascii_uppercase();
    let well_formed =
        code.len() == SHARE_CODE_LEN && code.bytes().all(|b| b.is_ascii_alphanumeric());
    well_formed.then_some(code)
}

/// A code not yet present in the store, or `None` after `MAX_ATTEMPTS` collisions.
pub async fn generate_unique(pool: &SqlitePool) -> Result<Option<String>, sqlx::Error> {
    generate_unique_from(pool, generate).await
}

pub(crate) async fn generate_unique_from(
    pool: &SqlitePool,
    mut next: impl FnMut() -> String,
) -> Result<Option<String>, sqlx::Error> {
    for attempt in 1..=MAX_ATTEMPTS {
        let candidate = next();
        if !Challenge::share_code_exists(pool, &candidate).await? {
            return Ok(Some(candidate));
        }
        warn!(attempt, "Share code collision, regenerating");
    }
    Ok(None)
}
