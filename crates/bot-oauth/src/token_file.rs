//! Persisted token file
//!
//! The bot reads its user-context credentials from a `KEY=value` file:
//!
//! ```text
//! OAUTH2_USER_ACCESS_TOKEN=...
//! OAUTH2_USER_REFRESH_TOKEN=...
//! OAUTH2_TOKEN_EXPIRES_IN=7200
//! OAUTH2_SCOPE=tweet.read tweet.write users.read offline.access
//! OAUTH2_TOKEN_TYPE=bearer
//! OAUTH2_TOKEN_EXPIRES_AT=1760000000
//! ```
//!
//! Every save replaces the whole file atomically, so a refresh that rotates
//! both tokens is observed as a single change.

use std::path::{Path, PathBuf};

use common::Secret;
use tracing::info;

use crate::constants::token_keys;
use crate::error::{Error, Result};
use crate::token::TokenSet;

#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Write the token set, replacing any previous file.
    pub async fn save(&self, tokens: &TokenSet) -> Result<()> {
        let expires_in = tokens.expires_in.to_string();
        let expires_at = tokens.expires_at().to_string();

        let mut pairs = vec![(token_keys::ACCESS_TOKEN, tokens.access_token.expose().as_str())];
        if let Some(refresh) = &tokens.refresh_token {
            pairs.push((token_keys::REFRESH_TOKEN, refresh.expose().as_str()));
        }
        pairs.extend([
            (token_keys::EXPIRES_IN, expires_in.as_str()),
            (token_keys::SCOPE, tokens.scope.as_str()),
            (token_keys::TOKEN_TYPE, tokens.token_type.as_str()),
            (token_keys::EXPIRES_AT, expires_at.as_str()),
        ]);

        common::envfile::write(&self.path, &pairs)
            .await
            .map_err(|e| Error::Io(format!("writing token file {}: {e}", self.path.display())))?;

        info!(
            path = %self.path.display(),
            expires_at = tokens.expires_at(),
            has_refresh_token = tokens.refresh_token.is_some(),
            "token file written"
        );
        Ok(())
    }

    /// Load a previously saved token set.
    ///
    /// Files written by older tooling lack `OAUTH2_TOKEN_EXPIRES_AT`; those are
    /// treated as issued at the file's modification time.
    pub async fn load(&self) -> Result<TokenSet> {
        let map = common::envfile::read_map(&self.path)
            .await
            .map_err(|e| Error::TokenFile(format!("reading {}: {e}", self.path.display())))?;

        let access_token = map
            .get(token_keys::ACCESS_TOKEN)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                Error::TokenFile(format!("{} is missing {}", self.path.display(), token_keys::ACCESS_TOKEN))
            })?;

        let expires_in = parse_u64(&map, token_keys::EXPIRES_IN)?.unwrap_or(0);
        let obtained_at = match parse_u64(&map, token_keys::EXPIRES_AT)? {
            Some(expires_at) => expires_at.saturating_sub(expires_in),
            None => self.modified_unix().await,
        };

        Ok(TokenSet {
            access_token: Secret::new(access_token),
            token_type: map
                .get(token_keys::TOKEN_TYPE)
                .cloned()
                .unwrap_or_else(|| "bearer".into()),
            expires_in,
            refresh_token: map
                .get(token_keys::REFRESH_TOKEN)
                .filter(|v| !v.trim().is_empty() && v.as_str() != "None")
                .cloned()
                .map(Secret::new),
            scope: map.get(token_keys::SCOPE).cloned().unwrap_or_default(),
            obtained_at,
        })
    }

    async fn modified_unix(&self) -> u64 {
        tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

fn parse_u64(map: &std::collections::HashMap<String, String>, key: &str) -> Result<Option<u64>> {
    map.get(key)
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| Error::TokenFile(format!("{key} is not a non-negative integer")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::parse_token_response;

    fn tokens(body: &str) -> TokenSet {
        parse_token_response(200, body).unwrap()
    }

    #[tokio::test]
    async fn save_writes_expected_keys() {
        let dir = tempfile::tempdir().unwrap();
        let file = TokenFile::new(dir.path().join("oauth_tokens.env"));
        let set = tokens(
            r#"{"token_type":"bearer","expires_in":7200,"access_token":"at_1","refresh_token":"rt_1","scope":"tweet.read tweet.write"}"#,
        );

        file.save(&set).await.unwrap();

        let contents = tokio::fs::read_to_string(file.path()).await.unwrap();
        assert!(contents.contains("OAUTH2_USER_ACCESS_TOKEN=at_1\n"));
        assert!(contents.contains("OAUTH2_USER_REFRESH_TOKEN=rt_1\n"));
        assert!(contents.contains("OAUTH2_TOKEN_EXPIRES_IN=7200\n"));
        assert!(contents.contains("OAUTH2_SCOPE=tweet.read tweet.write\n"));
        assert!(contents.contains(&format!("OAUTH2_TOKEN_EXPIRES_AT={}\n", set.expires_at())));
    }

    #[tokio::test]
    async fn save_then_load_preserves_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let file = TokenFile::new(dir.path().join("oauth_tokens.env"));
        let set = tokens(
            r#"{"token_type":"bearer","expires_in":7200,"access_token":"at_1","refresh_token":"rt_1","scope":"users.read"}"#,
        );

        file.save(&set).await.unwrap();
        let loaded = file.load().await.unwrap();

        assert_eq!(loaded.access_token.expose(), "at_1");
        assert_eq!(loaded.refresh_token.as_ref().unwrap().expose(), "rt_1");
        assert_eq!(loaded.expires_in, 7200);
        assert_eq!(loaded.expires_at(), set.expires_at());
        assert_eq!(loaded.scope, "users.read");
        assert_eq!(loaded.token_type, "bearer");
    }

    #[tokio::test]
    async fn absent_refresh_token_is_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let file = TokenFile::new(dir.path().join("oauth_tokens.env"));
        file.save(&tokens(
            r#"{"token_type":"bearer","expires_in":60,"access_token":"at"}"#,
        ))
        .await
        .unwrap();

        let contents = tokio::fs::read_to_string(file.path()).await.unwrap();
        assert!(!contents.contains("OAUTH2_USER_REFRESH_TOKEN"));
        assert!(file.load().await.unwrap().refresh_token.is_none());
    }

    #[tokio::test]
    async fn loads_legacy_file_without_expires_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth_tokens.env");
        tokio::fs::write(
            &path,
            "OAUTH2_USER_ACCESS_TOKEN=at_legacy\nOAUTH2_USER_REFRESH_TOKEN=None\nOAUTH2_TOKEN_EXPIRES_IN=7200\nOAUTH2_SCOPE=tweet.read\n",
        )
        .await
        .unwrap();

        let loaded = TokenFile::new(&path).load().await.unwrap();
        assert_eq!(loaded.access_token.expose(), "at_legacy");
        assert!(loaded.refresh_token.is_none(), "literal None means absent");
        assert!(loaded.obtained_at > 0);
        assert!(!loaded.is_expired());
    }

    #[tokio::test]
    async fn load_rejects_missing_access_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth_tokens.env");
        tokio::fs::write(&path, "OAUTH2_USER_REFRESH_TOKEN=rt\n").await.unwrap();

        let err = TokenFile::new(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::TokenFile(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn load_rejects_non_numeric_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth_tokens.env");
        tokio::fs::write(&path, "OAUTH2_USER_ACCESS_TOKEN=at\nOAUTH2_TOKEN_EXPIRES_IN=soon\n")
            .await
            .unwrap();

        assert!(TokenFile::new(&path).load().await.is_err());
    }

    #[tokio::test]
    async fn load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = TokenFile::new(dir.path().join("absent.env"));
        assert!(!file.exists().await);
        assert!(file.load().await.is_err());
    }

    #[tokio::test]
    async fn save_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = TokenFile::new(dir.path().join("oauth_tokens.env"));
        file.save(&tokens(
            r#"{"token_type":"bearer","expires_in":60,"access_token":"at_old","refresh_token":"rt_old"}"#,
        ))
        .await
        .unwrap();
        file.save(&tokens(
            r#"{"token_type":"bearer","expires_in":60,"access_token":"at_new","refresh_token":"rt_new"}"#,
        ))
        .await
        .unwrap();

        let contents = tokio::fs::read_to_string(file.path()).await.unwrap();
        assert!(!contents.contains("at_old"));
        assert!(!contents.contains("rt_old"));
        assert_eq!(contents.matches("OAUTH2_USER_ACCESS_TOKEN=").count(), 1);
    }
}
