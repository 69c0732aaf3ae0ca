use crate::core::error::{Error, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

const MAGIC: &[u8; 4] = b"DXFL";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 8;

/// Exact nearest-neighbour index over squared L2 distance.
///
/// Vectors are stored row-major; row `i` belongs to chunk record `i`.
/// The index is append-only.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of stored vectors
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append vectors, rejecting any with the wrong dimension
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            return Err(Error::Model(format!(
                "Embedding dimension mismatch: index has {}, got {}",
                self.dimension,
                bad.len()
            )));
        }
        self.data.reserve(vectors.len() * self.dimension);
        for vector in vectors {
            self.data.extend_from_slice(vector);
        }
        Ok(())
    }

    /// Row `i` of the index
    pub fn vector(&self, i: usize) -> Option<&[f32]> {
        let start = i.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// The `k` closest rows as `(row, squared distance)`, closest first.
    /// Ties go to the lower row.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if query.len() != self.dimension {
            return Err(Error::Model(format!(
                "Query dimension mismatch: index has {}, got {}",
                self.dimension,
                query.len()
            )));
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        // Max-heap on distance: the worst kept candidate sits on top
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        for (row, vector) in self.data.chunks_exact(self.dimension).enumerate() {
            heap.push(Candidate {
                row,
                distance: squared_l2(query, vector),
            });
            if heap.len() > k {
                heap.pop();
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| (c.row, c.distance))
            .collect())
    }

    /// Serialize as `DXFL | version u32 | dimension u64 | count u64 | f32 data`, little endian
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dimension as u64).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for value in &self.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Parse a blob written by [`FlatIndex::to_bytes`]. Errors carry a description of the defect.
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < HEADER_LEN {
            return Err(format!("index blob too short ({} bytes)", bytes.len()));
        }
        if &bytes[0..4] != MAGIC {
            return Err("index blob has an unknown format".to_string());
        }

        let version = u32::from_le_bytes(read_array(&bytes[4..8]));
        if version != FORMAT_VERSION {
            return Err(format!("unsupported index format version {}", version));
        }
        let dimension = u64::from_le_bytes(read_array(&bytes[8..16])) as usize;
        let count = u64::from_le_bytes(read_array(&bytes[16..24])) as usize;

        let expected = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| "index blob header overflows".to_string())?;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != expected {
            return Err(format!(
                "index blob holds {} bytes of vectors, header promises {}",
                payload.len(),
                expected
            ));
        }

        let data = payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(read_array(b)))
            .collect();
        Ok(Self { dimension, data })
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Squared Euclidean distance
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Map a distance onto (0, 1], closer is higher
pub fn distance_to_similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

struct Candidate {
    row: usize,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.row.cmp(&other.row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> FlatIndex {
        let mut index = FlatIndex::new(3);
        index
            .add(&[
                vec![1.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.9, 0.1, 0.0],
                vec![1.0, 0.0, 0.0],
            ])
            .unwrap();
        index
    }

    #[test]
    fn test_search_orders_by_distance() {
        let index = sample_index();
        let results = index.search(&[1.0, 0.0, 0.0], 3).unwrap();

        assert_eq!(results.len(), 3);
        // Exact duplicates tie at distance zero; lower row first
        assert_eq!(results[0], (0, 0.0));
        assert_eq!(results[1], (3, 0.0));
        assert_eq!(results[2].0, 2);
        assert!((results[2].1 - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_search_k_larger_than_index() {
        let index = sample_index();
        let results = index.search(&[0.0, 1.0, 0.0], 10).unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = sample_index();
        assert!(index.add(&[vec![1.0, 2.0]]).is_err());
        assert!(index.search(&[1.0], 1).is_err());
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_blob_round_trip_and_corruption() {
        let index = sample_index();
        let bytes = index.to_bytes();
        let restored = FlatIndex::from_bytes(&bytes).unwrap();
        assert_eq!(restored, index);
        assert_eq!(restored.vector(2), Some(&[0.9f32, 0.1, 0.0][..]));

        assert!(FlatIndex::from_bytes(&bytes[..bytes.len() - 4]).is_err());
        assert!(FlatIndex::from_bytes(b"NOPE").is_err());

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(FlatIndex::from_bytes(&bad_magic).is_err());
    }

    #[test]
    fn test_distance_to_similarity() {
        assert_eq!(distance_to_similarity(0.0), 1.0);
        assert!((distance_to_similarity(1.0) - 0.5).abs() < 1e-6);
    }
}
