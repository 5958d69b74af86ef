use std::fmt;

/// Crockford base-32 alphabet: digits and uppercase letters without I, L, O and U.
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Rendered length of a 32-byte digest.
pub const KEY_LEN: usize = 52;

/// Identifier of a cached object: the BLAKE3 digest of the request path in Crockford base-32.
/// Doubles as the on-disk file name and the ETag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a request path. Anything from the first `?` on is ignored.
    pub fn from_path(path: &str) -> Self {
        let path = path.split_once('?').map(|(path, _)| path).unwrap_or(path);
        let digest = blake3::hash(path.as_bytes());
        Self(encode_base32(digest.as_bytes()))
    }

    /// Accepts a file name discovered on disk if it has the shape of a rendered key.
    pub fn from_file_name(name: &str) -> Option<Self> {
        (name.len() == KEY_LEN && name.bytes().all(|byte| ALPHABET.contains(&byte)))
            .then(|| Self(name.to_string()))
    }

    /// Wraps a name that does not have the key shape. Such entries are indexed for budget
    /// accounting only.
    pub(super) fn foreign(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unpadded, most-significant-bit-first base-32.
fn encode_base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u16 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u16::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[usize::from((buffer >> bits) & 0x1f)] as char);
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(ALPHABET[usize::from((buffer << (5 - bits)) & 0x1f)] as char);
    }
    out
}
