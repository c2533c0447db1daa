//! Credential token pool for the upstream chat backend
//!
//! Holds the ordered list of upstream credential tokens together with a
//! quarantine set, and mirrors every accepted token into a newline-delimited
//! append-only file so the pool survives restarts.
//!
//! Token lifecycle:
//! 1. Admin uploads tokens → appended to the file, then to the in-memory list
//! 2. Requests select tokens round-robin, skipping quarantined values
//! 3. Upstream rejects a token with 401/403 → token quarantined (kept on file)
//! 4. Scheduled refresh revalidates active tokens and quarantines failures
//! 5. Admin clear → list, quarantine set and file emptied together

pub mod error;
pub mod pool;
pub mod refresh;
pub mod store;
pub mod token;

pub use error::{Error, Result};
pub use pool::{Pool, PoolSnapshot, RefreshReport};
pub use refresh::{TokenValidator, Validity, spawn_refresh_task};
pub use store::{TokenStore, parse_token_lines};
pub use token::CredentialToken;
