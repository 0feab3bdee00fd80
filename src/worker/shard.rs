//! Phrase sharding across tabs

/// Partition `items` into `shards` contiguous slices whose sizes differ by
/// at most one; the remainder is spread one-per-shard over the leading
/// shards. Panics if `shards` is zero (callers guarantee at least one
/// active tab before sharding).
pub fn partition<T: Clone>(items: &[T], shards: usize) -> Vec<Vec<T>> {
    assert!(shards > 0, "shard count must be positive");

    let base = items.len() / shards;
    let remainder = items.len() % shards;

    let mut out = Vec::with_capacity(shards);
    let mut offset = 0;
    for i in 0..shards {
        let size = base + usize::from(i < remainder);
        out.push(items[offset..offset + size].to_vec());
        offset += size;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phrases(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("phrase {}", i)).collect()
    }

    #[test]
    fn test_sizes_sum_and_balance() {
        for (n, shards) in [(97, 10), (10, 10), (3, 10), (0, 4), (100, 1), (7, 3)] {
            let parts = partition(&phrases(n), shards);
            assert_eq!(parts.len(), shards);
            assert_eq!(parts.iter().map(Vec::len).sum::<usize>(), n);

            let max = parts.iter().map(Vec::len).max().unwrap();
            let min = parts.iter().map(Vec::len).min().unwrap();
            assert!(max - min <= 1, "unbalanced split for n={} shards={}", n, shards);
        }
    }

    #[test]
    fn test_97_phrases_over_10_tabs() {
        let parts = partition(&phrases(97), 10);
        let sizes: Vec<usize> = parts.iter().map(Vec::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 97);
        assert_eq!(sizes.iter().filter(|&&s| s == 10).count(), 7);
        assert_eq!(sizes.iter().filter(|&&s| s == 9).count(), 3);
    }

    #[test]
    fn test_shards_are_contiguous_and_ordered() {
        let parts = partition(&phrases(11), 3);
        let flat: Vec<String> = parts.into_iter().flatten().collect();
        assert_eq!(flat, phrases(11));
    }
}
