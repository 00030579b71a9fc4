use sha2::{Digest, Sha256};

/// Incremental SHA-256 over content that arrives in chunks.
#[derive(Debug, Clone, Default)]
pub struct ContentDigest {
    hasher: Sha256,
    bytes: u64,
}

impl ContentDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Lowercase hex digest.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Best-effort media type sniffed from the first bytes of an object.
///
/// This is not authoritative and returns `None` for plain text formats such as CSV.
pub fn detect_media_type(head: &[u8]) -> Option<&'static str> {
    infer::get(head).map(|kind| kind.mime_type())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_matches_known_value() {
        let mut digest = ContentDigest::new();
        digest.update(b"Hello, ");
        digest.update(b"World!");
        assert_eq!(digest.bytes(), 13);
        assert_eq!(
            digest.finish(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_detects_png() {
        let png_header = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(detect_media_type(&png_header), Some("image/png"));
        assert_eq!(detect_media_type(b"id,value\n1,2\n"), None);
    }
}
