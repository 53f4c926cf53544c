//! Versioned layout of the on-device database.
//!
//! Upgrades are additive only: a version may add column families, never
//! remove or rename one, so opening an older directory just creates what is
//! missing.

/// Column family for store metadata (schema version, id sequences)
pub const META_CF: &str = "_meta";

pub const QUIZ_RESULTS: &str = "quiz_results";
pub const GAME_PROGRESS: &str = "game_progress";
pub const AUTH_TOKENS: &str = "auth_tokens";
pub const SYNC_QUEUE: &str = "sync_queue";

/// Fixed name of the database directory inside the data dir
pub const DATABASE_NAME: &str = "classroom_offline_db";

pub const SCHEMA_VERSION: u32 = 2;

pub(crate) const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Collections introduced by each schema version
const MIGRATIONS: &[(u32, &[&str])] = &[
    (1, &[QUIZ_RESULTS, GAME_PROGRESS, AUTH_TOKENS]),
    (2, &[SYNC_QUEUE]),
];

/// Every collection that exists at `version`
pub fn collections_for(version: u32) -> Vec<&'static str> {
    MIGRATIONS
        .iter()
        .filter(|(v, _)| *v <= version)
        .flat_map(|(_, names)| names.iter().copied())
        .collect()
}

/// Collections added after `from` up to and including `to`
pub fn collections_added_between(from: u32, to: u32) -> Vec<&'static str> {
    MIGRATIONS
        .iter()
        .filter(|(v, _)| *v > from && *v <= to)
        .flat_map(|(_, names)| names.iter().copied())
        .collect()
}

/// Collections holding syncable records (everything except the token)
pub fn record_collections() -> [&'static str; 3] {
    [QUIZ_RESULTS, GAME_PROGRESS, SYNC_QUEUE]
}

pub(crate) fn decode_version(bytes: &[u8]) -> u32 {
    String::from_utf8_lossy(bytes).parse::<u32>().unwrap_or(0)
}
