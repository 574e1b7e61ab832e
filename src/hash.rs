use hex::encode;
use sha2::{Digest, Sha224};

pub struct Hash;

impl Hash {
    /// SHA-224 of the rendered script text, hex encoded. This is the value
    /// stored in the change history CHECKSUM column.
    pub fn compute_checksum(content: &str) -> String {
        let mut hasher = Sha224::new();
        hasher.update(content.as_bytes());
        encode(hasher.finalize())
    }

    pub fn short_checksum<'a>(checksum: &Option<&'a str>) -> &'a str {
        match checksum {
            Some(checksum) => &checksum[..checksum.len().min(7)],
            None => "-",
        }
    }
}
