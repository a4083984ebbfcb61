//! TDigest helpers for latency percentiles.
//!
//! Rollups store a compressed digest of the successful response times in their
//! window so percentile estimates survive the deletion of raw results.

use tdigests::{Centroid, TDigest};
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

/// Maximum centroids kept per stored digest.
pub const DIGEST_SIZE: usize = 100;

/// Build a compressed digest from raw latencies. `None` when there are no values.
pub fn latency_digest(values: Vec<f64>) -> Option<TDigest> {
    if values.is_empty() {
        return None;
    }
    let mut td = TDigest::from_values(values);
    td.compress(DIGEST_SIZE);
    Some(td)
}

/// Merge several digests into one by pooling their centroids.
pub fn merge_digests<'a, I>(digests: I) -> Option<TDigest>
where
    I: IntoIterator<Item = &'a TDigest>,
{
    let mut centroids: Vec<Centroid> = digests
        .into_iter()
        .flat_map(|td| td.centroids().iter().map(|c| Centroid::new(c.mean, c.weight)))
        .collect();
    if centroids.is_empty() {
        return None;
    }
    centroids.sort_by(|a, b| a.mean.total_cmp(&b.mean));
    let mut td = TDigest::from_centroids(centroids);
    td.compress(DIGEST_SIZE);
    Some(td)
}

/// Serialize a TDigest to bytes for storage.
///
/// Format: [centroid_count: varint] [mean_bits: varint, weight_bits: varint]...
pub fn serialize_tdigest(td: &TDigest) -> Vec<u8> {
    let centroids = td.centroids();
    let mut data = Vec::with_capacity(centroids.len() * 16 + 4);

    let mut buf = varint_encode::u64_buffer();
    data.extend_from_slice(varint_encode::u64(centroids.len() as u64, &mut buf));

    for c in centroids {
        data.extend_from_slice(varint_encode::u64(c.mean.to_bits(), &mut buf));
        data.extend_from_slice(varint_encode::u64(c.weight.to_bits(), &mut buf));
    }

    data
}

/// Deserialize a TDigest from stored bytes.
pub fn deserialize_tdigest(data: &[u8]) -> Option<TDigest> {
    if data.is_empty() {
        return None;
    }

    let (count, mut remaining) = varint_decode::u64(data).ok()?;
    if count == 0 {
        return None;
    }

    let mut centroids = Vec::with_capacity(count.min(DIGEST_SIZE as u64 * 4) as usize);
    for _ in 0..count {
        let (mean_bits, rest) = varint_decode::u64(remaining).ok()?;
        let (weight_bits, rest) = varint_decode::u64(rest).ok()?;
        remaining = rest;
        centroids.push(Centroid::new(f64::from_bits(mean_bits), f64::from_bits(weight_bits)));
    }

    Some(TDigest::from_centroids(centroids))
}

/// Quantile estimate with NaN/inf mapped to zero.
pub fn estimate_quantile(td: &TDigest, q: f64) -> f64 {
    let v = td.estimate_quantile(q);
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let td = latency_digest(vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();

        let data = serialize_tdigest(&td);
        let td2 = deserialize_tdigest(&data).unwrap();

        assert!((td.estimate_quantile(0.5) - td2.estimate_quantile(0.5)).abs() < 0.01);
    }

    #[test]
    fn test_empty_data() {
        assert!(deserialize_tdigest(&[]).is_none());
        assert!(latency_digest(Vec::new()).is_none());
        assert!(merge_digests(std::iter::empty()).is_none());
    }

    #[test]
    fn test_merge_keeps_range() {
        let low = latency_digest((1..=50).map(f64::from).collect()).unwrap();
        let high = latency_digest((51..=100).map(f64::from).collect()).unwrap();
        let merged = merge_digests([&low, &high]).unwrap();

        let median = estimate_quantile(&merged, 0.5);
        assert!(median > 40.0 && median < 60.0, "median {}", median);
        assert!(estimate_quantile(&merged, 0.99) > 90.0);
    }
}
