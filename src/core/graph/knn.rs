use faer::MatRef;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::assert_ncols;

///////////
// Enums //
///////////

/// Similarity measure for the cross-set neighbour search
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KnnMetric {
    /// Negative squared Euclidean distance
    Euclidean,
    /// Cosine similarity
    Cosine,
}

////////////////
// Structures //
////////////////

/// Helper struct for KNN with heap
///
/// ### Fields
///
/// * `index` - Index position of that neighbour
/// * `similarity` - Similarity value for that neighbour
#[derive(Debug)]
struct SimilarityItem {
    index: usize,
    similarity: f32,
}

impl Eq for SimilarityItem {}

impl PartialEq for SimilarityItem {
    fn eq(&self, other: &Self) -> bool {
        self.similarity == other.similarity && self.index == other.index
    }
}

/// Reversed ordering so that `BinaryHeap` acts as a min-heap on similarity.
/// Lower indices are preferred on equal similarity, which keeps results
/// deterministic.
impl Ord for SimilarityItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .similarity
            .partial_cmp(&self.similarity)
            .unwrap_or(Ordering::Equal)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for SimilarityItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/////////////
// Helpers //
/////////////

/// Similarity between a row of `a` and a row of `b`
#[inline]
fn row_similarity(
    a: &MatRef<f32>,
    i: usize,
    b: &MatRef<f32>,
    j: usize,
    metric: KnnMetric,
    norms_a: &[f32],
    norms_b: &[f32],
) -> f32 {
    match metric {
        KnnMetric::Euclidean => {
            let mut sum = 0_f32;
            for d in 0..a.ncols() {
                let diff = a[(i, d)] - b[(j, d)];
                sum += diff * diff;
            }
            -sum
        }
        KnnMetric::Cosine => {
            let denom = norms_a[i] * norms_b[j];
            if denom <= 0.0 {
                return 0.0;
            }
            let mut dot = 0_f32;
            for d in 0..a.ncols() {
                dot += a[(i, d)] * b[(j, d)];
            }
            dot / denom
        }
    }
}

/// L2 norms of all rows
fn row_norms(mat: &MatRef<f32>) -> Vec<f32> {
    (0..mat.nrows())
        .map(|i| {
            (0..mat.ncols())
                .map(|d| mat[(i, d)] * mat[(i, d)])
                .sum::<f32>()
                .sqrt()
        })
        .collect()
}

////////////////////
// Main functions //
////////////////////

/// Exact k-nearest neighbours of every query row among the reference rows
///
/// ### Params
///
/// * `query` - Samples x features matrix of the query points
/// * `reference` - Samples x features matrix of the reference points
/// * `k` - Number of neighbours to return per query
/// * `metric` - The similarity to use
///
/// ### Returns
///
/// Per query a vector of `(reference_index, similarity)` sorted by
/// decreasing similarity. For `Euclidean` the similarity is the negative
/// squared distance.
pub fn knn_cross(
    query: MatRef<f32>,
    reference: MatRef<f32>,
    k: usize,
    metric: KnnMetric,
) -> Vec<Vec<(usize, f32)>> {
    assert_ncols!(query, reference);

    let k = k.min(reference.nrows());
    let norms_q = match metric {
        KnnMetric::Cosine => row_norms(&query),
        KnnMetric::Euclidean => Vec::new(),
    };
    let norms_r = match metric {
        KnnMetric::Cosine => row_norms(&reference),
        KnnMetric::Euclidean => Vec::new(),
    };

    (0..query.nrows())
        .into_par_iter()
        .map(|i| {
            if k == 0 {
                return Vec::new();
            }
            let mut heap = BinaryHeap::with_capacity(k + 1);
            for j in 0..reference.nrows() {
                let sim = row_similarity(&query, i, &reference, j, metric, &norms_q, &norms_r);
                heap.push(SimilarityItem {
                    index: j,
                    similarity: sim,
                });
                if heap.len() > k {
                    heap.pop();
                }
            }

            // into_sorted_vec is ascending w.r.t. Ord, i.e. descending similarity
            heap.into_sorted_vec()
                .into_iter()
                .map(|item| (item.index, item.similarity))
                .collect()
        })
        .collect()
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    fn create_clustered_data(offset: f32) -> Mat<f32> {
        // 2 well separated clusters of 20 points each
        Mat::from_fn(40, 2, |i, j| {
            let centre = if i < 20 { 0.0 } else { 10.0 };
            centre + offset + ((i * (j + 1)) as f32 * 0.37) % 1.0
        })
    }

    #[test]
    fn test_knn_cross_neighbours_in_same_cluster() {
        let reference = create_clustered_data(0.0);
        let query = create_clustered_data(0.2);
        let res = knn_cross(query.as_ref(), reference.as_ref(), 5, KnnMetric::Euclidean);

        assert_eq!(res.len(), 40);
        for (i, neighbours) in res.iter().enumerate() {
            assert_eq!(neighbours.len(), 5);
            for &(j, _) in neighbours {
                assert_eq!(i < 20, j < 20, "Query {} matched across clusters", i);
            }
            for w in neighbours.windows(2) {
                assert!(w[0].1 >= w[1].1, "Neighbours not sorted");
            }
        }
    }

    #[test]
    fn test_knn_cosine_and_k_larger_than_reference() {
        let reference = Mat::from_fn(3, 2, |i, j| if i == j { 1.0 } else { 0.0 });
        let query = Mat::from_fn(1, 2, |_, j| if j == 1 { 2.0 } else { 0.1 });
        let res = knn_cross(query.as_ref(), reference.as_ref(), 10, KnnMetric::Cosine);
        assert_eq!(res[0].len(), 3);
        assert_eq!(res[0][0].0, 1);
        // the all-zero reference row has similarity 0
        assert_eq!(res[0][2].0, 2);
        assert_eq!(res[0][2].1, 0.0);
    }
}
