//! Container image reference parsing.
//!
//! References honor the standard format `domain[:port]/name[@algo:hex | :tag]`.
//! A reference has one of three shapes: name-only, tagged, or digest-pinned.
//! Only the digest-pinned form is ever committed to disk by the store.

use thiserror::Error;

/// Maximum tag length.
const MAX_TAG_LEN: usize = 127;

/// Minimum digest hex length.
const MIN_ENCODED_LEN: usize = 32;

/// Errors from reference parsing. All are terminal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,

    #[error("invalid tag {tag:?}: must match [\\w][\\w.-]* and be at most 127 characters")]
    InvalidTag { tag: String },

    #[error("invalid digest algorithm {algorithm:?}")]
    InvalidAlgorithm { algorithm: String },

    #[error("invalid digest encoding {encoded:?}: must be hex of at least 32 characters")]
    InvalidEncoding { encoded: String },

    #[error("malformed digest {digest:?}: expected algo:hex")]
    MalformedDigest { digest: String },

    #[error("reference {reference:?} is not digest-pinned")]
    NotDigestPinned { reference: String },

    #[error("reference {reference:?} has neither tag nor digest")]
    NameOnly { reference: String },
}

/// A validated content digest, `algo:hex`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    /// Parse and validate an `algo:hex` digest string.
    ///
    /// The algorithm is alphanumeric runs joined by the separators `-_+.`;
    /// the encoded value is lowercase hex of at least 32 characters.
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        let (algorithm, encoded) = s.split_once(':').ok_or_else(|| {
            ReferenceError::MalformedDigest {
                digest: s.to_string(),
            }
        })?;
        if !valid_algorithm(algorithm) {
            return Err(ReferenceError::InvalidAlgorithm {
                algorithm: algorithm.to_string(),
            });
        }
        if encoded.len() < MIN_ENCODED_LEN
            || !encoded.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ReferenceError::InvalidEncoding {
                encoded: encoded.to_string(),
            });
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_string(),
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

/// Algorithm grammar: alphanumeric runs joined by single `-`, `_`, `+`
/// or `.` separators.
fn valid_algorithm(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let bytes = s.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let sep = |b: u8| matches!(b, b'-' | b'_' | b'+' | b'.');
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    let mut prev_sep = false;
    for &b in bytes {
        if alnum(b) {
            prev_sep = false;
        } else if sep(b) {
            if prev_sep {
                return false;
            }
            prev_sep = true;
        } else {
            return false;
        }
    }
    true
}

/// Tag grammar: `[\w][\w.-]*`, at most 127 characters.
fn valid_tag(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_TAG_LEN {
        return false;
    }
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let bytes = s.as_bytes();
    word(bytes[0]) && bytes[1..].iter().all(|&b| word(b) || b == b'.' || b == b'-')
}

/// A parsed container image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, including any port.
    registry: String,
    /// Repository path within the registry.
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl ImageReference {
    /// Parse a reference string in any of its three shapes.
    pub fn parse(reference: &str) -> Result<Self, ReferenceError> {
        if reference.is_empty() {
            return Err(ReferenceError::Empty);
        }

        // Digest comes after '@' and may follow a tag.
        let (name_and_tag, digest) = match reference.rsplit_once('@') {
            Some((left, digest_str)) => (left, Some(Digest::parse(digest_str)?)),
            None => (reference, None),
        };

        // A tag colon is any ':' after the last '/'; earlier colons belong
        // to the registry port.
        let (name, tag) = match name_and_tag.rsplit_once(':') {
            Some((left, candidate)) if !candidate.contains('/') => {
                if !valid_tag(candidate) {
                    return Err(ReferenceError::InvalidTag {
                        tag: candidate.to_string(),
                    });
                }
                (left, Some(candidate.to_string()))
            }
            _ => (name_and_tag, None),
        };

        if name.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (registry, repository) = split_registry(name);
        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Whether this reference pins a digest.
    pub fn is_digest_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// Whether this reference names neither tag nor digest.
    pub fn is_name_only(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// The digest-pinned form of this reference.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: self.tag.clone(),
            digest: Some(digest),
        }
    }

    /// The digest, or a terminal error naming this reference.
    pub fn require_digest(&self) -> Result<&Digest, ReferenceError> {
        self.digest
            .as_ref()
            .ok_or_else(|| ReferenceError::NotDigestPinned {
                reference: self.to_string(),
            })
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split `domain[:port]/path` into registry host and repository path.
///
/// A first component without a dot, colon or `localhost` is a Docker Hub
/// style short name.
fn split_registry(name: &str) -> (String, String) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        Some(_) => ("registry-1.docker.io".to_string(), name.to_string()),
        None => (
            "registry-1.docker.io".to_string(),
            format!("library/{name}"),
        ),
    }
}
