//! Partition hash used to map keys onto vbuckets

/// Map a key onto a vbucket id in `[0, num_vbuckets)`
///
/// The digest is CRC-32 (IEEE); only its upper 15 bits are used, matching
/// the server side.
#[inline]
pub fn vbucket_hash(key: &[u8], num_vbuckets: usize) -> u16 {
    debug_assert!(num_vbuckets > 0);
    let digest = (crc32fast::hash(key) >> 16) & 0x7fff;
    (digest as usize % num_vbuckets) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32fast::hash(b""), 0);
    }

    #[test]
    fn test_vbucket_hash_in_range() {
        for key in [&b"a"[..], b"user::1", b"{tag}x", b""] {
            assert!(vbucket_hash(key, 1024) < 1024);
            assert!(vbucket_hash(key, 64) < 64);
        }
    }

    #[test]
    fn test_vbucket_hash_stable() {
        assert_eq!(vbucket_hash(b"foo", 1024), vbucket_hash(b"foo", 1024));
        // 0xCBF43926 >> 16 = 0xCBF4, & 0x7fff = 0x4BF4 = 19444
        assert_eq!(vbucket_hash(b"123456789", 1024), (19444 % 1024) as u16);
    }
}
