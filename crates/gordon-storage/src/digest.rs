//! Digest parsing, validation, and the shared path-safety guard used by both
//! `BlobStore` and `ManifestStore`.

use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256, Sha512};

use crate::error::StorageError;

/// A parsed `algorithm:hex` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Parse and validate a digest string of the form `sha256:<64 hex>` or
    /// `sha512:<128 hex>`. Rejects anything else as `InvalidDigest`.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let (algorithm, hex) = raw
            .split_once(':')
            .ok_or_else(|| StorageError::InvalidDigest(raw.to_string()))?;

        let expected_len = match algorithm {
            "sha256" => 64,
            "sha512" => 128,
            _ => return Err(StorageError::InvalidDigest(raw.to_string())),
        };

        if hex.len() != expected_len || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest(raw.to_string()));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_ascii_lowercase(),
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn as_string(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }

    /// Two-character shard prefix used by the sharded blob layout.
    pub fn shard(&self) -> &str {
        &self.hex[..2]
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Compute the `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Streaming SHA-256 hasher used while writing upload sessions and blobs.
#[derive(Default)]
pub struct StreamingSha256 {
    hasher: Sha256,
}

impl StreamingSha256 {
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.finalize()))
    }
}

/// Also available for digest computations against sha512 when an algorithm is
/// explicitly sha512; Gordon defaults to sha256 everywhere else.
pub fn sha512_digest(data: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(data);
    format!("sha512:{}", hex::encode(hasher.finalize()))
}

/// Repository path grammar from the data model:
/// `[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*`
pub fn validate_repository_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name.contains('\0') {
        return Err(StorageError::InvalidName(name.to_string()));
    }

    for segment in name.split('/') {
        if !is_valid_path_segment(segment) {
            return Err(StorageError::InvalidName(name.to_string()));
        }
    }

    Ok(())
}

/// A reference is either a tag or a digest. Tags share the segment grammar;
/// digests are validated separately via `Digest::parse`.
pub fn validate_reference(reference: &str) -> Result<(), StorageError> {
    if reference.is_empty() || reference.contains('\0') {
        return Err(StorageError::InvalidName(reference.to_string()));
    }
    if Digest::parse(reference).is_ok() {
        return Ok(());
    }
    if reference.len() > 128 || reference.contains('/') || reference.contains("..") {
        return Err(StorageError::InvalidName(reference.to_string()));
    }
    if !reference
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b':'))
    {
        return Err(StorageError::InvalidName(reference.to_string()));
    }
    Ok(())
}

fn is_valid_path_segment(segment: &str) -> bool {
    if segment.is_empty() || segment == "." || segment == ".." {
        return false;
    }
    let mut chars = segment.chars().peekable();
    let mut prev_was_separator = true;
    for c in &mut chars {
        let is_alnum = c.is_ascii_lowercase() || c.is_ascii_digit();
        let is_separator = matches!(c, '.' | '_' | '-');
        if is_alnum {
            prev_was_separator = false;
        } else if is_separator {
            if prev_was_separator {
                return false;
            }
            prev_was_separator = true;
        } else {
            return false;
        }
    }
    !prev_was_separator
}

/// Join `root` with a sequence of already-validated path components and
/// verify the result cannot escape `root` once canonicalized. Since the
/// caller has already restricted components to the name grammar (no `..`,
/// no leading `/`, no NUL), this is primarily a defense-in-depth guard
/// against symlink or platform path-parsing surprises.
pub fn safe_join(root: &Path, components: &[&str]) -> Result<PathBuf, StorageError> {
    let mut path = root.to_path_buf();
    for component in components {
        if component.is_empty() || component.contains("..") || component.contains('\0') {
            return Err(StorageError::PathEscapesRoot);
        }
        path.push(component);
    }

    // `root` itself may not exist yet on first run; canonicalize what does
    // exist and make sure the constructed path's lexical ancestry stays
    // inside it. We avoid requiring the final path to exist (it usually
    // doesn't yet, e.g. before a write).
    let root_abs = if root.exists() {
        root.canonicalize().map_err(StorageError::Io)?
    } else {
        root.to_path_buf()
    };

    if !path.starts_with(&root_abs) && !path.starts_with(root) {
        return Err(StorageError::PathEscapesRoot);
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_sha256() {
        let d = Digest::parse(
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        )
        .unwrap();
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.shard(), "2c");
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Digest::parse("sha256:deadbeef").is_err());
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert!(Digest::parse("md5:d41d8cd98f00b204e9800998ecf8427e").is_err());
    }

    #[test]
    fn repository_grammar_accepts_nested_paths() {
        assert!(validate_repository_name("library/alpine").is_ok());
        assert!(validate_repository_name("my.company/app-v2").is_ok());
    }

    #[test]
    fn repository_grammar_rejects_traversal() {
        assert!(validate_repository_name("../etc").is_err());
        assert!(validate_repository_name("a//b").is_err());
        assert!(validate_repository_name("/etc").is_err());
        assert!(validate_repository_name("a/../b").is_err());
    }

    #[test]
    fn reference_accepts_tag_or_digest() {
        assert!(validate_reference("latest").is_ok());
        assert!(validate_reference("v1.2.3").is_ok());
        assert!(validate_reference(
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        )
        .is_ok());
    }

    #[test]
    fn reference_rejects_traversal() {
        assert!(validate_reference("../latest").is_err());
        assert!(validate_reference("a/b").is_err());
    }
}
