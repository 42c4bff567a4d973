use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use deviant_core::{PersistenceError, TokenStore};

use super::REFRESH_TOKEN_VAR;

/// Refresh token kept as `DA_REFRESH_TOKEN=` in a `.env` file.
///
/// The file is read on every `load`, so a token rotated by another process
/// is picked up. `save` never creates the file.
#[derive(Debug, Clone)]
pub struct DotenvTokenStore {
    path: Option<PathBuf>,
}

impl DotenvTokenStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read_stored(&self, path: &Path) -> Result<Option<String>, PersistenceError> {
        let iter = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter,
            Err(err) if err.not_found() => return Ok(None),
            Err(err) => return Err(PersistenceError::new(format!("{}: {err}", path.display()))),
        };
        for item in iter {
            let (key, value) =
                item.map_err(|err| PersistenceError::new(format!("{}: {err}", path.display())))?;
            if key == REFRESH_TOKEN_VAR {
                return Ok(Some(value.trim().to_string()).filter(|value| !value.is_empty()));
            }
        }
        Ok(None)
    }
}

impl TokenStore for DotenvTokenStore {
    fn load(&self, fallback: &str) -> Result<String, PersistenceError> {
        let stored = match &self.path {
            Some(path) => self.read_stored(path)?,
            None => None,
        };
        Ok(stored.unwrap_or_else(|| fallback.trim().to_string()))
    }

    fn save(&self, token: &str) -> Result<(), PersistenceError> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| PersistenceError::new(".env file not found"))?;
        let contents = fs::read_to_string(path).map_err(|err| {
            PersistenceError::new(format!("cannot read {}: {err}", path.display()))
        })?;
        let updated = upsert_line(&contents, REFRESH_TOKEN_VAR, token.trim());

        let partial = path.with_extension("partial");
        write_file(&partial, &updated)
            .and_then(|()| fs::rename(&partial, path))
            .map_err(|err| {
                let _ = fs::remove_file(&partial);
                PersistenceError::new(format!("cannot write {}: {err}", path.display()))
            })?;
        tracing::debug!(path = %path.display(), "refresh token written to .env");
        Ok(())
    }
}

fn write_file(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()
}

/// Replaces the first `key=` assignment (with or without `export`), or
/// appends one. Other lines are kept byte for byte.
fn upsert_line(contents: &str, key: &str, value: &str) -> String {
    let assignment = format!("{key}={}", quote(value));
    let mut replaced = false;
    let mut lines: Vec<String> = Vec::new();
    for line in contents.lines() {
        if !replaced && assigns(line, key) {
            lines.push(assignment.clone());
            replaced = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        lines.push(assignment);
    }
    let mut output = lines.join("\n");
    output.push('\n');
    output
}

fn assigns(line: &str, key: &str) -> bool {
    let line = line.trim_start();
    let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
    line.strip_prefix(key)
        .is_some_and(|rest| rest.trim_start().starts_with('='))
}

fn quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '+' | ':'))
    {
        value.to_string()
    } else {
        let mut quoted = String::with_capacity(value.len() + 2);
        quoted.push('"');
        for c in value.chars() {
            match c {
                '\\' | '"' | '$' => {
                    quoted.push('\\');
                    quoted.push(c);
                }
                '\n' => quoted.push_str("\\n"),
                _ => quoted.push(c),
            }
        }
        quoted.push('"');
        quoted
    }
}
