use std::fmt;

use blake2::Blake2b512;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "SHA256")]
    Sha256,
    #[serde(rename = "SHA512")]
    Sha512,
    #[serde(rename = "BLAKE3")]
    Blake3,
    /// BLAKE2b with a 512-bit digest.
    #[serde(rename = "BLAKE2b")]
    Blake2b,
}

/// Outcome of resolving a requested algorithm name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAlgorithm {
    pub algorithm: HashAlgorithm,
    /// Set when the requested name was unsupported and the default was used instead.
    pub substituted_for: Option<String>,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
            Self::Blake3 => "BLAKE3",
            Self::Blake2b => "BLAKE2b",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "SHA256" => Some(Self::Sha256),
            "SHA512" => Some(Self::Sha512),
            "BLAKE3" => Some(Self::Blake3),
            "BLAKE2B" | "BLAKE2B512" => Some(Self::Blake2b),
            _ => None,
        }
    }

    /// Map a requested name to a supported algorithm, falling back to SHA256.
    pub fn resolve(name: &str) -> ResolvedAlgorithm {
        match Self::from_name(name) {
            Some(algorithm) => ResolvedAlgorithm {
                algorithm,
                substituted_for: None,
            },
            None => ResolvedAlgorithm {
                algorithm: Self::default(),
                substituted_for: Some(name.to_string()),
            },
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running digest state for any supported algorithm.
pub(crate) enum Digester {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake3(Box<blake3::Hasher>),
    Blake2b(Box<Blake2b512>),
}

impl Digester {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Blake2b => Self::Blake2b(Box::new(Blake2b512::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
            Self::Blake2b(h) => h.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
            Self::Blake2b(h) => hex::encode(h.finalize()),
        }
    }
}
