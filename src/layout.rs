use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;

pub const INDEX_FILENAME: &str = "queries.json";
pub const DATA_DIRNAME: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestError {
    reason: String,
}

impl DigestError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for DigestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for DigestError {}

/// Digests name files, so anything user-supplied must be plain lowercase hex.
pub fn validate_digest(digest: &str) -> Result<(), DigestError> {
    if digest.is_empty() {
        return Err(DigestError::new("digest cannot be empty"));
    }
    if !digest
        .bytes()
        .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
    {
        return Err(DigestError::new(format!(
            "digest `{digest}` must be lowercase hexadecimal"
        )));
    }
    Ok(())
}

pub fn index_path(root: &Path) -> PathBuf {
    root.join(INDEX_FILENAME)
}

pub fn data_dir(root: &Path) -> PathBuf {
    root.join(DATA_DIRNAME)
}

pub fn entry_path(root: &Path, digest: &str) -> PathBuf {
    data_dir(root).join(format!("{digest}.json"))
}

/// Creates `<root>` and `<root>/data` if they are missing.
pub fn ensure_layout(root: &Path) -> anyhow::Result<()> {
    let data_dir = data_dir(root);
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("create recording dir {}", data_dir.display()))
}
