//! `KEY=value` file codec
//!
//! Used for the local development secrets file and the persisted token file.
//! Reads are tolerant of blank lines, `#` comments and an optional `export `
//! prefix. Writes go through a temp file in the same directory followed by a
//! rename, so a concurrent reader sees either the old or the new file, never a
//! partial one. Written files are mode 0600 on unix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Parse env-file contents into ordered `(key, value)` pairs.
///
/// Later duplicates are kept; callers building a map get last-wins semantics.
pub fn parse(contents: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for (index, raw) in contents.lines().enumerate() {
        if let Some(pair) = parse_line(raw, index + 1)? {
            pairs.push(pair);
        }
    }
    Ok(pairs)
}

fn parse_line(raw: &str, line: usize) -> Result<Option<(String, String)>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);

    let (key, value) = trimmed.split_once('=').ok_or_else(|| Error::EnvFile {
        line,
        message: "expected KEY=value".into(),
    })?;
    let key = key.trim();
    if !is_valid_key(key) {
        return Err(Error::EnvFile {
            line,
            message: format!("invalid key {key:?}"),
        });
    }

    Ok(Some((key.to_owned(), unquote(value.trim(), line)?)))
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn unquote(value: &str, line: usize) -> Result<String> {
    if let Some(inner) = value.strip_prefix('\'') {
        return inner
            .strip_suffix('\'')
            .map(str::to_owned)
            .ok_or_else(|| Error::EnvFile {
                line,
                message: "unterminated single quote".into(),
            });
    }
    if let Some(inner) = value.strip_prefix('"') {
        let inner = inner.strip_suffix('"').ok_or_else(|| Error::EnvFile {
            line,
            message: "unterminated double quote".into(),
        })?;
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        }
        return Ok(out);
    }
    Ok(value.to_owned())
}

/// Render a single `KEY=value` line (no trailing newline).
///
/// Values that would not survive a plain round trip are double-quoted.
pub fn render_line(key: &str, value: &str) -> String {
    let needs_quotes = value != value.trim()
        || value.starts_with('"')
        || value.starts_with('\'')
        || value.starts_with('#')
        || value.contains('\n');
    if !needs_quotes {
        return format!("{key}={value}");
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    format!("{key}=\"{escaped}\"")
}

/// Read and parse an env file into a map (last duplicate wins).
pub async fn read_map(path: &Path) -> Result<HashMap<String, String>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(parse(&contents)?.into_iter().collect())
}

/// Replace the whole file with the given pairs, atomically.
pub async fn write(path: &Path, pairs: &[(&str, &str)]) -> Result<()> {
    let mut out = String::new();
    for (key, value) in pairs {
        out.push_str(&render_line(key, value));
        out.push('\n');
    }
    write_atomic(path, &out).await
}

/// Insert or replace keys in an env file, keeping every other line as-is.
///
/// Existing keys are rewritten in place (later duplicates of an updated key
/// are dropped); new keys are appended. A missing file is created.
pub async fn upsert(path: &Path, updates: &[(&str, &str)]) -> Result<()> {
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let mut written: Vec<&str> = Vec::new();
    let mut out = String::with_capacity(existing.len());
    for (index, raw) in existing.lines().enumerate() {
        let key = parse_line(raw, index + 1)?.map(|(k, _)| k);
        let update = key
            .as_deref()
            .and_then(|k| updates.iter().find(|(name, _)| *name == k));
        match update {
            Some((name, _)) if written.contains(name) => continue,
            Some((name, value)) => {
                out.push_str(&render_line(name, value));
                written.push(*name);
            }
            None => out.push_str(raw),
        }
        out.push('\n');
    }
    for (name, value) in updates {
        if !written.contains(name) {
            out.push_str(&render_line(name, value));
            out.push('\n');
        }
    }

    write_atomic(path, &out).await
}

/// Write contents to `path` via temp file + rename, mode 0600.
async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = temp_path(path)?;

    tokio::fs::write(&tmp_path, contents.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    debug!(path = %path.display(), "persisted env file");
    Ok(())
}

fn temp_path(path: &Path) -> Result<PathBuf> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("{} has no file name", path.display())))?
        .to_string_lossy();
    Ok(dir.join(format!(".{name}.tmp.{}", std::process::id())))
}
