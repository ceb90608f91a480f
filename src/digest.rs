use std::convert::TryFrom;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use data_encoding::HEXLOWER;
use ring::digest;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lowercase hex SHA-256, used to address both blobs and deployments.
#[derive(Clone, Debug, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hash: String,
}

impl Digest {
    pub fn from_sha256(digest: &digest::Digest) -> Digest {
        Digest {
            hash: HEXLOWER.encode(digest.as_ref()),
        }
    }

    pub fn of(content: &[u8]) -> Digest {
        Self::from_sha256(&digest::digest(&digest::SHA256, content))
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }

    pub fn to_path(&self) -> PathBuf {
        Path::new(&self.hash[0..2])
            .join(&self.hash[2..4])
            .join(&self.hash[4..6])
            .join(&self.hash[6..])
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(Error::InvalidDigest(s.to_string()));
        }

        Ok(Digest {
            hash: s.to_string(),
        })
    }
}

// We implement this so that serde_json can parse a Digest from a straight string
impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.hash
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}
