use faer::{Mat, MatRef};
use rand::prelude::*;

/// K-means clustering with k-means++ style seeding
///
/// The first centroid is drawn at random, every following centroid is the
/// point furthest away from the already chosen ones. Afterwards Lloyd's
/// algorithm runs until assignments stop changing or `max_iters` is hit.
///
/// ### Params
///
/// * `data` - Samples x features matrix to cluster
/// * `k` - Number of clusters. Gets capped at the number of samples.
/// * `max_iters` - Maximum number of Lloyd iterations
/// * `seed` - Random seed for reproducibility
///
/// ### Return
///
/// Vector with usizes, indicating cluster membership
pub fn kmeans(data: MatRef<f32>, k: usize, max_iters: usize, seed: u64) -> Vec<usize> {
    let n = data.nrows();
    let d = data.ncols();
    if n == 0 {
        return Vec::new();
    }
    let k = k.clamp(1, n);

    let mut labels = vec![0; n];
    let mut centroids = Mat::<f32>::zeros(k, d);

    let mut rng = StdRng::seed_from_u64(seed);
    let first = rng.random_range(0..n);
    for dim in 0..d {
        centroids[(0, dim)] = data[(first, dim)];
    }

    let sq_dist = |centroids: &Mat<f32>, i: usize, c: usize| -> f32 {
        (0..d)
            .map(|dim| (data[(i, dim)] - centroids[(c, dim)]).powi(2))
            .sum::<f32>()
    };

    for c in 1..k {
        let mut best_idx = 0;
        let mut best_dist = f32::NEG_INFINITY;
        for i in 0..n {
            let dist = (0..c)
                .map(|prev| sq_dist(&centroids, i, prev))
                .fold(f32::INFINITY, f32::min);
            if dist > best_dist {
                best_dist = dist;
                best_idx = i;
            }
        }
        for dim in 0..d {
            centroids[(c, dim)] = data[(best_idx, dim)];
        }
    }

    // Lloyd's algorithm
    for iter in 0..max_iters {
        let mut changed = false;
        for i in 0..n {
            let mut min_dist = f32::INFINITY;
            let mut best = labels[i];
            for c in 0..k {
                let dist = sq_dist(&centroids, i, c);
                if dist < min_dist {
                    min_dist = dist;
                    best = c;
                }
            }
            if best != labels[i] {
                labels[i] = best;
                changed = true;
            }
        }

        if iter > 0 && !changed {
            break;
        }

        let mut counts = vec![0_usize; k];
        let mut new_centroids = Mat::<f32>::zeros(k, d);
        for i in 0..n {
            counts[labels[i]] += 1;
            for dim in 0..d {
                new_centroids[(labels[i], dim)] += data[(i, dim)];
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                for dim in 0..d {
                    new_centroids[(c, dim)] /= counts[c] as f32;
                }
            } else {
                // keep empty clusters where they were
                for dim in 0..d {
                    new_centroids[(c, dim)] = centroids[(c, dim)];
                }
            }
        }
        centroids = new_centroids;
    }

    labels
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kmeans_separates_blobs() {
        let data = Mat::from_fn(30, 2, |i, j| {
            let centre = match i / 10 {
                0 => 0.0,
                1 => 8.0,
                _ => -8.0,
            };
            centre + ((i + j) as f32 * 0.13) % 0.5
        });
        let labels = kmeans(data.as_ref(), 3, 50, 42);
        for block in 0..3 {
            let first = labels[block * 10];
            for i in block * 10..(block + 1) * 10 {
                assert_eq!(labels[i], first);
            }
        }
        assert_ne!(labels[0], labels[10]);
        assert_ne!(labels[10], labels[20]);
        assert_ne!(labels[0], labels[20]);
    }

    #[test]
    fn test_kmeans_caps_k() {
        let data = Mat::from_fn(2, 2, |i, _| i as f32);
        let labels = kmeans(data.as_ref(), 5, 10, 1);
        assert_eq!(labels.len(), 2);
        assert_ne!(labels[0], labels[1]);
    }
}
