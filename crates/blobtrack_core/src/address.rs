use std::fmt;

pub const ADDRESS_SCHEME: &str = "DB://";

/// Pointer to a content blob inside a named storage cluster.
///
/// Wire form is `DB://<cluster>/<blobId>[/<hash>]`. `parse` and `Display`
/// are exact inverses for every valid string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAddress {
    pub cluster: String,
    pub blob_id: u64,
    pub hash: Option<String>,
}

impl BlobAddress {
    pub fn new(cluster: impl Into<String>, blob_id: u64) -> Self {
        Self {
            cluster: cluster.into(),
            blob_id,
            hash: None,
        }
    }

    pub fn with_hash(cluster: impl Into<String>, blob_id: u64, hash: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            blob_id,
            hash: Some(hash.into()),
        }
    }

    /// Parse an address string. Anything that does not match the wire form
    /// yields `None`; callers treat that as "not one of our addresses", not
    /// as an error.
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.strip_prefix(ADDRESS_SCHEME)?;
        let (cluster, rest) = rest.split_once('/')?;
        if cluster.is_empty() || !cluster.bytes().all(is_word_byte) {
            return None;
        }
        let (id_part, hash_part) = match rest.split_once('/') {
            Some((id, hash)) => (id, Some(hash)),
            None => (rest, None),
        };
        if id_part.is_empty() || !id_part.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        let blob_id = id_part.parse::<u64>().ok()?;
        let hash = match hash_part {
            Some(hash) => {
                if hash.is_empty() || !hash.bytes().all(|byte| byte.is_ascii_hexdigit()) {
                    return None;
                }
                Some(hash.to_string())
            }
            None => None,
        };
        Some(Self {
            cluster: cluster.to_string(),
            blob_id,
            hash,
        })
    }
}

impl fmt::Display for BlobAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ADDRESS_SCHEME}{}/{}", self.cluster, self.blob_id)?;
        if let Some(hash) = &self.hash {
            write!(f, "/{hash}")?;
        }
        Ok(())
    }
}

/// Address prefix shared by every blob stored in `cluster`, used to build
/// `LIKE` patterns for cluster-scoped scans.
pub fn cluster_address_prefix(cluster: &str) -> String {
    format!("{ADDRESS_SCHEME}{cluster}/")
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}
