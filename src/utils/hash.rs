/// Content hashes arrive as lowercase hex digests: 32 chars (md5) or 64
/// chars (sha-256). Anything else is rejected before touching storage.
pub fn is_valid_file_hash(hash: &str) -> bool {
    matches!(hash.len(), 32 | 64)
        && !hash.bytes().any(|b| b.is_ascii_uppercase())
        && hex::decode(hash).is_ok()
}

/// Chunk indices are canonical decimal strings ("0", "1", ... no sign, no
/// leading zeros) so that the cache set and the on-disk fragment names agree.
pub fn is_canonical_chunk_index(index: &str) -> bool {
    index
        .parse::<u32>()
        .map(|v| v.to_string() == index)
        .unwrap_or(false)
}
