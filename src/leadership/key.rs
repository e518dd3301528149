//! Lock Key Derivation
//!
//! Maps a cache table to the 64-bit advisory lock key its instances compete for.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over `bytes`. Stable across processes, platforms and compiler versions.
pub(crate) fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Derives the advisory lock key for `schema.table`.
///
/// Deployments sharing one database but serving different tables get
/// different keys; every instance serving the same table gets the same key.
/// Names are hashed as given: the cache table is addressed by quoted,
/// case-sensitive identifiers, so `Cache_Items` and `cache_items` are
/// different tables with different keys.
pub fn lock_key(schema: &str, table: &str) -> i64 {
    let namespace = format!("{}.{}", schema, table);
    fnv1a64(namespace.as_bytes()) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv_reference_values() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_lock_key_is_deterministic() {
        assert_eq!(
            lock_key("public", "cache_items"),
            lock_key("public", "cache_items")
        );
    }

    #[test]
    fn test_lock_key_is_case_sensitive() {
        assert_ne!(
            lock_key("Public", "Cache_Items"),
            lock_key("public", "cache_items")
        );
    }

    #[test]
    fn test_lock_key_separates_deployments() {
        let base = lock_key("public", "cache_items");
        assert_ne!(base, lock_key("tenant_a", "cache_items"));
        assert_ne!(base, lock_key("public", "sessions"));
        assert_ne!(lock_key("ab", "c"), lock_key("a", "bc"));
    }
}
