//! Append-only token file
//!
//! One token per line. New tokens are appended and flushed; nothing is ever
//! rewritten in place except by `truncate`, which empties the file. The pool
//! calls into the store while holding its own lock, so the store itself does
//! not need to serialize writers.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::token::CredentialToken;

/// Parse newline-delimited token text.
///
/// Lines are trimmed; blank lines and lines starting with `#` are skipped.
pub fn parse_token_lines(text: &str) -> Vec<CredentialToken> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(CredentialToken::new)
        .collect()
}

/// Durable mirror of the pool's token sequence.
#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Open the token file and return the tokens it already holds.
    ///
    /// If the file doesn't exist it is created empty (cold start with zero
    /// tokens), along with any missing parent directories.
    pub async fn load(path: PathBuf) -> Result<(Self, Vec<CredentialToken>)> {
        let tokens = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading token file: {e}")))?;
            let tokens = parse_token_lines(&contents);
            info!(path = %path.display(), tokens = tokens.len(), "loaded tokens");
            tokens
        } else {
            info!(path = %path.display(), "token file not found, starting with empty pool");
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| Error::Store(format!("creating token directory: {e}")))?;
            }
            create_restricted(&path).await?;
            Vec::new()
        };

        Ok((Self { path }, tokens))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append tokens, one per line, and flush to disk.
    pub async fn append(&self, tokens: &[CredentialToken]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for token in tokens {
            buf.push_str(token.expose());
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::Store(format!("opening token file: {e}")))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| Error::Store(format!("appending to token file: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| Error::Store(format!("syncing token file: {e}")))?;

        debug!(path = %self.path.display(), count = tokens.len(), "appended tokens");
        Ok(())
    }

    /// Empty the file.
    pub async fn truncate(&self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::Store(format!("truncating token file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Store(format!("syncing token file: {e}")))?;
        debug!(path = %self.path.display(), "truncated token file");
        Ok(())
    }
}

/// Create an empty file readable only by the owner, since it holds secrets.
async fn create_restricted(path: &Path) -> Result<()> {
    tokio::fs::write(path, b"")
        .await
        .map_err(|e| Error::Store(format!("creating token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting token file permissions: {e}")))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(values: &[&str]) -> Vec<CredentialToken> {
        values.iter().map(|v| CredentialToken::new(*v)).collect()
    }

    #[test]
    fn parse_skips_blank_and_comment_lines() {
        let parsed = parse_token_lines("sk-aaa\n#comment\nsk-bbb\n\n");
        assert_eq!(parsed, tokens(&["sk-aaa", "sk-bbb"]));
    }

    #[test]
    fn parse_trims_whitespace_and_crlf() {
        let parsed = parse_token_lines("  sk-aaa  \r\n\t\r\nsk-bbb\r\n");
        assert_eq!(parsed, tokens(&["sk-aaa", "sk-bbb"]));
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("token.txt");

        assert!(!path.exists());
        let (_store, loaded) = TokenStore::load(path.clone()).await.unwrap();
        assert!(loaded.is_empty());
        assert!(path.exists());
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "");
    }

    #[tokio::test]
    async fn append_then_reload_preserves_order_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.txt");

        let (store, _) = TokenStore::load(path.clone()).await.unwrap();
        store.append(&tokens(&["sk-aaa", "sk-bbb"])).await.unwrap();
        store.append(&tokens(&["sk-aaa"])).await.unwrap();

        let (_store, loaded) = TokenStore::load(path).await.unwrap();
        assert_eq!(loaded, tokens(&["sk-aaa", "sk-bbb", "sk-aaa"]));
    }

    #[tokio::test]
    async fn load_ignores_comments_in_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.txt");
        tokio::fs::write(&path, "# seeded by hand\nsk-aaa\n\nsk-bbb\n")
            .await
            .unwrap();

        let (_store, loaded) = TokenStore::load(path).await.unwrap();
        assert_eq!(loaded, tokens(&["sk-aaa", "sk-bbb"]));
    }

    #[tokio::test]
    async fn truncate_empties_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.txt");

        let (store, _) = TokenStore::load(path.clone()).await.unwrap();
        store.append(&tokens(&["sk-aaa"])).await.unwrap();
        store.truncate().await.unwrap();

        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "");
        let (_store, loaded) = TokenStore::load(path).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn new_file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.txt");
        let (store, _) = TokenStore::load(path.clone()).await.unwrap();
        store.append(&tokens(&["sk-aaa"])).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "token file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn append_empty_slice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.txt");
        let (store, _) = TokenStore::load(path.clone()).await.unwrap();
        store.append(&[]).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "");
    }
}
