//! Line-oriented rewriting of `<key> = <value>` settings.
//!
//! Files are handled as bytes so lines that do not match stay byte-identical
//! whatever their encoding or line terminator.

use crate::error::ConfigWriteError;
use serde::{Deserialize, Serialize};
use simcal_core::atomic_write_bytes;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    First,
    #[default]
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSetting {
    pub key: String,
    pub value: String,
    pub scope: Scope,
    pub required: bool,
}

impl ConfigSetting {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            scope: Scope::All,
            required: true,
        }
    }

    /// Multi-column setting: the values are written space-separated on one line.
    pub fn repeated<S: AsRef<str>>(key: impl Into<String>, values: &[S]) -> Self {
        let joined = values
            .iter()
            .map(|v| v.as_ref())
            .collect::<Vec<_>>()
            .join(" ");
        Self::new(key, joined)
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Rewrites the lines of `config_path` that assign `setting.key`. Returns the
/// number of lines replaced.
pub fn apply(config_path: &Path, setting: &ConfigSetting) -> Result<usize, ConfigWriteError> {
    let counts = apply_all(config_path, std::slice::from_ref(setting))?;
    Ok(counts.first().copied().unwrap_or(0))
}

/// Applies `settings` in order with a single read and a single atomic write.
/// Nothing is written if any required setting is missing.
pub fn apply_all(
    config_path: &Path,
    settings: &[ConfigSetting],
) -> Result<Vec<usize>, ConfigWriteError> {
    let original = fs::read(config_path).map_err(|source| ConfigWriteError::Read {
        path: config_path.to_path_buf(),
        source,
    })?;
    let mut text = original.clone();
    let mut counts = Vec::with_capacity(settings.len());
    for setting in settings {
        let (rewritten, count) = rewrite(&text, setting)?;
        if count == 0 && setting.required {
            return Err(ConfigWriteError::NoMatch {
                key: setting.key.clone(),
                path: config_path.to_path_buf(),
            });
        }
        text = rewritten;
        counts.push(count);
    }
    if text != original {
        atomic_write_bytes(config_path, &text).map_err(|source| ConfigWriteError::Write {
            path: config_path.to_path_buf(),
            source,
        })?;
    }
    Ok(counts)
}

fn rewrite(text: &[u8], setting: &ConfigSetting) -> Result<(Vec<u8>, usize), ConfigWriteError> {
    let key = setting.key.trim();
    if key.is_empty() {
        return Err(ConfigWriteError::EmptyKey);
    }
    let mut out = Vec::with_capacity(text.len() + setting.value.len());
    let mut count = 0;
    for line in text.split_inclusive(|b| *b == b'\n') {
        let done = setting.scope == Scope::First && count > 0;
        let (content, terminator) = split_terminator(line);
        match assignment_end(content, key.as_bytes()) {
            Some(end) if !done => {
                out.extend_from_slice(&content[..end]);
                out.push(b' ');
                out.extend_from_slice(setting.value.as_bytes());
                out.extend_from_slice(terminator);
                count += 1;
            }
            _ => out.extend_from_slice(line),
        }
    }
    Ok((out, count))
}

fn split_terminator(line: &[u8]) -> (&[u8], &[u8]) {
    if line.ends_with(b"\r\n") {
        line.split_at(line.len() - 2)
    } else if line.ends_with(b"\n") {
        line.split_at(line.len() - 1)
    } else {
        (line, &[])
    }
}

/// Index just past the `=` when `content` is `<indent><key><ws>=...`.
fn assignment_end(content: &[u8], key: &[u8]) -> Option<usize> {
    let is_blank = |b: &u8| *b == b' ' || *b == b'\t';
    let indent = content.iter().take_while(|b| is_blank(b)).count();
    let rest = &content[indent..];
    if !rest.starts_with(key) {
        return None;
    }
    let after = &rest[key.len()..];
    let gap = after.iter().take_while(|b| is_blank(b)).count();
    if after.get(gap) == Some(&b'=') {
        Some(indent + key.len() + gap + 1)
    } else {
        None
    }
}
