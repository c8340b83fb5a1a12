use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::canonical::{self, QueryValue};

/// The read operations that get recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Find,
    Distinct,
    Aggregate,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::Distinct => "distinct",
            Self::Aggregate => "aggregate",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "find" => Ok(Self::Find),
            "distinct" => Ok(Self::Distinct),
            "aggregate" => Ok(Self::Aggregate),
            other => anyhow::bail!(
                "unknown operation `{other}`; expected one of find, distinct, aggregate"
            ),
        }
    }
}

/// Computes the digest a recording is stored under.
///
/// The hash input is the operation name, the model name and the canonical text of the query,
/// concatenated with no separators. Nothing else goes in: no version, no salt. Two triples whose
/// concatenations coincide (say model `ab` + query `c` against model `a` + query `bc`) share a
/// digest, and so does any pair of queries that collide under SHA-256.
pub fn compute_digest(op: Operation, model_name: &str, query: &QueryValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(op.as_str().as_bytes());
    hasher.update(model_name.as_bytes());
    hasher.update(canonical::to_string(query).as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter().copied() {
        out.push(char::from(HEX[(byte >> 4) as usize]));
        out.push(char::from(HEX[(byte & 0x0f) as usize]));
    }
    out
}
