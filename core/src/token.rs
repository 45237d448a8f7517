//! Line-access tokens: the coupling between read and write.
//!
//! A token binds a path, a 1-based inclusive line range, the CRC32C of
//! that range and the file's total line count. It is encoded as an opaque
//! URL-safe string and authenticated with a per-process MAC, so a token
//! that did not come from this broker instance fails `decode` outright.
//! Tokens are pure values; validity is only ever judged against the file
//! content presented at validation time.

use std::path::Path;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::Hmac;
use hmac::Mac;
use rand::RngCore;
use sha1::Digest;
use sha1::Sha1;

use crate::digest;
use crate::error::AccessError;
use crate::error::StaleReason;
use crate::sandbox::SafePath;

type HmacSha1 = Hmac<Sha1>;

const PATH_HASH_LEN: usize = 8;
const PAYLOAD_LEN: usize = PATH_HASH_LEN + 4 * 5; // path hash + 5 u32 fields
const TAG_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineAccessToken {
    pub path: PathBuf,
    pub start_line: u32,
    pub end_line: u32,
    pub range_crc: u32,
    pub total_lines: u32,
    nonce: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenValidity {
    Valid,
    Stale(StaleReason),
}

impl LineAccessToken {
    /// Judge this token against the file's current range content and line
    /// count. `current_range` must be the token's own range extracted from
    /// the present file (clamped to its line count).
    pub fn validate(&self, current_range: &[String], current_total: u32) -> TokenValidity {
        if self.total_lines != current_total {
            return TokenValidity::Stale(StaleReason::LineCountChanged);
        }
        if self.start_line > current_total && !(self.start_line == 0 && current_total == 0) {
            return TokenValidity::Stale(StaleReason::OutOfRange);
        }
        if digest::range_crc(current_range) != self.range_crc {
            return TokenValidity::Stale(StaleReason::RangeCrcMismatch);
        }
        TokenValidity::Valid
    }

    /// Whether this token's range includes `start..=end`, allowing a wider
    /// prior token to authorise a narrower request without reissuance.
    pub fn covers(&self, start: u32, end: u32) -> bool {
        self.start_line <= start && end <= self.end_line
    }
}

/// Issues and verifies tokens under a key drawn once per process.
pub struct TokenCodec {
    key: [u8; 32],
}

impl TokenCodec {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Issue a token for `start..=end` of `path`. `range_content` must be
    /// exactly the lines of that range; zero-line files use `start == end == 0`
    /// with an empty range.
    pub fn issue(
        &self,
        path: &SafePath,
        start_line: u32,
        end_line: u32,
        range_content: &[String],
        total_lines: u32,
    ) -> LineAccessToken {
        debug_assert!(start_line <= end_line);
        debug_assert!(end_line <= total_lines);
        LineAccessToken {
            path: path.to_path_buf(),
            start_line,
            end_line,
            range_crc: digest::range_crc(range_content),
            total_lines,
            nonce: rand::rng().next_u32(),
        }
    }

    /// Render a token as its opaque wire form.
    pub fn encode(&self, token: &LineAccessToken) -> String {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..PATH_HASH_LEN].copy_from_slice(&path_hash(&token.path));
        payload[8..12].copy_from_slice(&token.start_line.to_be_bytes());
        payload[12..16].copy_from_slice(&token.end_line.to_be_bytes());
        payload[16..20].copy_from_slice(&token.range_crc.to_be_bytes());
        payload[20..24].copy_from_slice(&token.total_lines.to_be_bytes());
        payload[24..28].copy_from_slice(&token.nonce.to_be_bytes());

        let mut packed = Vec::with_capacity(PAYLOAD_LEN + TAG_LEN);
        packed.extend_from_slice(&payload);
        packed.extend_from_slice(&self.tag(&payload));
        URL_SAFE_NO_PAD.encode(packed)
    }

    /// Decode and authenticate a wire token, binding it to `expected_path`.
    pub fn decode(&self, encoded: &str, expected_path: &SafePath) -> Result<LineAccessToken, AccessError> {
        let packed = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(|_| AccessError::MalformedToken)?;
        if packed.len() != PAYLOAD_LEN + TAG_LEN {
            return Err(AccessError::MalformedToken);
        }
        let (payload, tag) = packed.split_at(PAYLOAD_LEN);
        if self.tag(payload) != tag {
            return Err(AccessError::MalformedToken);
        }
        if payload[..PATH_HASH_LEN] != path_hash(expected_path.as_path()) {
            return Err(AccessError::PathMismatch(expected_path.to_path_buf()));
        }
        Ok(LineAccessToken {
            path: expected_path.to_path_buf(),
            start_line: read_u32(payload, 8),
            end_line: read_u32(payload, 12),
            range_crc: read_u32(payload, 16),
            total_lines: read_u32(payload, 20),
            nonce: read_u32(payload, 24),
        })
    }

    fn tag(&self, payload: &[u8]) -> [u8; TAG_LEN] {
        // HMAC keyed per process; constructing with a 32-byte key cannot
        // fail, but the Mac API returns Result, so fall back to a zeroed
        // tag that will simply never verify.
        let mut mac = match HmacSha1::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => return [0u8; TAG_LEN],
        };
        mac.update(payload);
        let full = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&full[..TAG_LEN]);
        tag
    }
}

impl Default for TokenCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn path_hash(path: &Path) -> [u8; PATH_HASH_LEN] {
    let digest = Sha1::digest(path.to_string_lossy().as_bytes());
    let mut hash = [0u8; PATH_HASH_LEN];
    hash.copy_from_slice(&digest[..PATH_HASH_LEN]);
    hash
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::Config;
    use crate::config::ConfigOverrides;
    use crate::sandbox::PathSandbox;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tempfile::tempdir;

    fn safe_path(dir: &TempDir, name: &str) -> SafePath {
        std::fs::write(dir.path().join(name), "x").unwrap();
        let config = Config::load_with_overrides(ConfigOverrides {
            roots: Some(vec![dir.path().to_path_buf()]),
            ..Default::default()
        })
        .unwrap();
        PathSandbox::new(&config).sanitize(name, true).unwrap()
    }

    fn lines(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn encode_decode_round_trips() {
        let dir = tempdir().unwrap();
        let path = safe_path(&dir, "a.txt");
        let codec = TokenCodec::new();
        let content = lines(&["one", "two"]);
        let token = codec.issue(&path, 1, 2, &content, 5);
        let encoded = codec.encode(&token);
        assert!(encoded.len() <= 128);
        assert!(encoded.is_ascii());
        let decoded = codec.decode(&encoded, &path).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn issued_token_validates_against_its_own_content() {
        let dir = tempdir().unwrap();
        let path = safe_path(&dir, "a.txt");
        let codec = TokenCodec::new();
        let content = lines(&["alpha", "beta"]);
        let token = codec.issue(&path, 3, 4, &content, 10);
        assert_eq!(token.validate(&content, 10), TokenValidity::Valid);
    }

    #[test]
    fn changed_total_or_content_makes_the_token_stale() {
        let dir = tempdir().unwrap();
        let path = safe_path(&dir, "a.txt");
        let codec = TokenCodec::new();
        let content = lines(&["alpha"]);
        let token = codec.issue(&path, 1, 1, &content, 1);
        assert_eq!(
            token.validate(&content, 2),
            TokenValidity::Stale(StaleReason::LineCountChanged)
        );
        assert_eq!(
            token.validate(&lines(&["ALPHA"]), 1),
            TokenValidity::Stale(StaleReason::RangeCrcMismatch)
        );
    }

    #[test]
    fn tampered_token_is_malformed() {
        let dir = tempdir().unwrap();
        let path = safe_path(&dir, "a.txt");
        let codec = TokenCodec::new();
        let token = codec.issue(&path, 1, 1, &lines(&["x"]), 1);
        let mut encoded = codec.encode(&token);
        // Flip a character somewhere in the payload.
        let flipped = if encoded.starts_with('A') { "B" } else { "A" };
        encoded.replace_range(0..1, flipped);
        assert!(matches!(
            codec.decode(&encoded, &path),
            Err(AccessError::MalformedToken)
        ));
    }

    #[test]
    fn token_from_another_process_key_fails() {
        let dir = tempdir().unwrap();
        let path = safe_path(&dir, "a.txt");
        let codec = TokenCodec::new();
        let other = TokenCodec::new();
        let token = codec.issue(&path, 1, 1, &lines(&["x"]), 1);
        let encoded = codec.encode(&token);
        assert!(matches!(
            other.decode(&encoded, &path),
            Err(AccessError::MalformedToken)
        ));
    }

    #[test]
    fn wrong_path_is_a_path_mismatch() {
        let dir = tempdir().unwrap();
        let a = safe_path(&dir, "a.txt");
        let b = safe_path(&dir, "b.txt");
        let codec = TokenCodec::new();
        let token = codec.issue(&a, 1, 1, &lines(&["x"]), 1);
        let encoded = codec.encode(&token);
        assert!(matches!(
            codec.decode(&encoded, &b),
            Err(AccessError::PathMismatch(_))
        ));
    }

    #[test]
    fn covers_is_inclusive_containment() {
        let dir = tempdir().unwrap();
        let path = safe_path(&dir, "a.txt");
        let codec = TokenCodec::new();
        let token = codec.issue(&path, 10, 20, &[], 100);
        assert!(token.covers(10, 20));
        assert!(token.covers(12, 15));
        assert!(!token.covers(9, 15));
        assert!(!token.covers(12, 21));
    }

    #[test]
    fn zero_line_file_token_validates_empty_content() {
        let dir = tempdir().unwrap();
        let path = safe_path(&dir, "a.txt");
        let codec = TokenCodec::new();
        let token = codec.issue(&path, 0, 0, &[], 0);
        assert_eq!(token.validate(&[], 0), TokenValidity::Valid);
        assert!(token.covers(0, 0));
    }
}
