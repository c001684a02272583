//! One-byte hash prefix distributor

use crate::{Error, Result};

/// Largest number of buckets addressable with a one-byte prefix
pub const MAX_BUCKETS: usize = 256;

/// Spreads logical row keys over `buckets` hash-prefixed key spaces.
///
/// The prefix is a pure function of the logical key, so reads and writes
/// always agree on it without any shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowKeyDistributor {
    buckets: usize,
}

impl RowKeyDistributor {
    pub fn new(buckets: usize) -> Result<Self> {
        if buckets == 0 || buckets > MAX_BUCKETS {
            return Err(Error::Config(format!(
                "row key buckets must be in 1..={}, got {}",
                MAX_BUCKETS, buckets
            )));
        }
        Ok(Self { buckets })
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }

    /// Hash prefix for a logical key, in `[0, buckets)`
    pub fn prefix_for(&self, logical_key: &[u8]) -> u8 {
        let mut hash: i32 = 1;
        for &b in logical_key {
            hash = hash.wrapping_mul(31).wrapping_add(b as i8 as i32);
        }
        (hash % self.buckets as i32).unsigned_abs() as u8
    }

    /// Physical key for a logical key
    pub fn distribute(&self, logical_key: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(logical_key.len() + 1);
        key.push(self.prefix_for(logical_key));
        key.extend_from_slice(logical_key);
        key
    }

    /// Strip the prefix from a physical key
    pub fn original_key<'a>(&self, physical_key: &'a [u8]) -> &'a [u8] {
        physical_key.get(1..).unwrap_or_default()
    }

    /// Every prefix a key can carry, ascending
    pub fn all_prefixes(&self) -> impl Iterator<Item = u8> {
        (0..self.buckets).map(|b| b as u8)
    }

    /// Physical scan ranges covering the logical range `[start, stop)`.
    ///
    /// One half-open range per bucket. An unbounded `stop` is capped at the
    /// next prefix so ranges never overlap.
    pub fn distributed_ranges(
        &self,
        start: &[u8],
        stop: Option<&[u8]>,
    ) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.all_prefixes()
            .map(|prefix| {
                let mut lower = Vec::with_capacity(start.len() + 1);
                lower.push(prefix);
                lower.extend_from_slice(start);

                let upper = match stop {
                    Some(stop) => {
                        let mut upper = Vec::with_capacity(stop.len() + 1);
                        upper.push(prefix);
                        upper.extend_from_slice(stop);
                        Some(upper)
                    }
                    None => prefix.checked_add(1).map(|next| vec![next]),
                };
                (lower, upper)
            })
            .collect()
    }

    /// Evenly spaced region boundaries for pre-splitting a table into
    /// `splits` regions. With `splits == buckets` every bucket gets its own
    /// region: `[1], [2], ..., [buckets - 1]`.
    pub fn split_keys(&self, splits: usize) -> Vec<Vec<u8>> {
        let splits = splits.clamp(1, self.buckets);
        let mut keys: Vec<Vec<u8>> = (1..splits)
            .map(|i| vec![(i * self.buckets / splits) as u8])
            .collect();
        keys.dedup();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_is_deterministic_and_in_range() {
        let distributor = RowKeyDistributor::new(16).unwrap();
        let keys: [&[u8]; 4] = [b"", b"a", b"metric", &[0xff, 0x80, 0x7f]];
        for key in keys {
            let prefix = distributor.prefix_for(key);
            assert!((prefix as usize) < 16);
            assert_eq!(prefix, distributor.prefix_for(key));
        }
        // 1 * 31 + 'a'
        assert_eq!(distributor.prefix_for(b"a"), (128 % 16) as u8);
    }

    #[test]
    fn test_negative_bytes_hash_to_valid_prefix() {
        let distributor = RowKeyDistributor::new(7).unwrap();
        let prefix = distributor.prefix_for(&[0xff; 32]);
        assert!(prefix < 7);
    }

    #[test]
    fn test_distribute_and_strip() {
        let distributor = RowKeyDistributor::new(16).unwrap();
        let physical = distributor.distribute(b"row");
        assert_eq!(physical.len(), 4);
        assert_eq!(physical[0], distributor.prefix_for(b"row"));
        assert_eq!(distributor.original_key(&physical), b"row");
    }

    #[test]
    fn test_bucket_bounds() {
        assert!(RowKeyDistributor::new(0).is_err());
        assert!(RowKeyDistributor::new(257).is_err());
        assert!(RowKeyDistributor::new(256).is_ok());
    }

    #[test]
    fn test_split_keys_one_region_per_bucket() {
        let distributor = RowKeyDistributor::new(4).unwrap();
        assert_eq!(
            distributor.split_keys(4),
            vec![vec![1u8], vec![2u8], vec![3u8]]
        );
        assert_eq!(distributor.split_keys(2), vec![vec![2u8]]);
        assert!(distributor.split_keys(1).is_empty());
        // more splits than buckets is capped
        assert_eq!(distributor.split_keys(10).len(), 3);
    }

    #[test]
    fn test_distributed_ranges_cover_every_bucket() {
        let distributor = RowKeyDistributor::new(3).unwrap();
        let ranges = distributor.distributed_ranges(b"a", Some(b"c"));
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[1], (b"\x01a".to_vec(), Some(b"\x01c".to_vec())));

        let open = distributor.distributed_ranges(b"a", None);
        assert_eq!(open[2], (b"\x02a".to_vec(), Some(vec![3u8])));

        let full = RowKeyDistributor::new(256).unwrap();
        let last = full.distributed_ranges(b"", None).pop().unwrap();
        assert_eq!(last, (vec![255u8], None));
    }
}
