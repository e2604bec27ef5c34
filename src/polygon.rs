//! Even-odd scan conversion of 2D polygons onto a voxel slice.
//!
//! Vertices are given in continuous voxel index coordinates `[x, y]` and each
//! voxel is sampled at its centre, i.e. voxel `(row, col)` is the point
//! `(col, row)`. Edge crossings follow the half-open rule so that shared
//! boundaries between adjacent polygons are painted exactly once.

use ndarray::{Array2, s};

const COLLINEAR_TOLERANCE: f64 = 1e-9;

/// Rasterize a closed polygon into a `(rows, cols)` boolean mask
///
/// A voxel is inside when a ray cast from its centre crosses the boundary an
/// odd number of times. Polygons with fewer than three vertices, with
/// non-finite vertices, or whose vertices are all collinear cover nothing.
pub fn fill_polygon(vertices: &[[f64; 2]], shape: (usize, usize)) -> Array2<bool> {
    let (rows, cols) = shape;
    let mut mask = Array2::from_elem((rows, cols), false);
    if vertices.len() < 3
        || vertices.iter().flatten().any(|v| !v.is_finite())
        || is_collinear(vertices)
    {
        return mask;
    }

    let mut crossings = Vec::with_capacity(vertices.len());
    for (row, mut line) in mask.outer_iter_mut().enumerate() {
        let y = row as f64;
        crossings.clear();
        crossings.extend(edges(vertices).filter_map(|(a, b)| crossing(a, b, y)));
        crossings.sort_by(f64::total_cmp);

        for span in crossings.chunks_exact(2) {
            let start = span[0].ceil().clamp(0.0, cols as f64) as usize;
            let end = span[1].ceil().clamp(0.0, cols as f64) as usize;
            if start < end {
                line.slice_mut(s![start..end]).fill(true);
            }
        }
    }
    mask
}

/// Number of distinct vertices, compared exactly
pub fn distinct_vertices(vertices: &[[f64; 2]]) -> usize {
    let mut sorted = vertices.to_vec();
    sorted.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    sorted.dedup();
    sorted.len()
}

/// True when every vertex lies on a single line (zero enclosed area)
pub fn is_collinear(vertices: &[[f64; 2]]) -> bool {
    let Some(first) = vertices.first() else {
        return true;
    };
    let Some(second) = vertices.iter().find(|v| *v != first) else {
        return true;
    };
    let (dx, dy) = (second[0] - first[0], second[1] - first[1]);
    let base = dx.hypot(dy);
    vertices.iter().all(|v| {
        let (ex, ey) = (v[0] - first[0], v[1] - first[1]);
        (dx * ey - dy * ex).abs() <= COLLINEAR_TOLERANCE * base * ex.hypot(ey).max(1.0)
    })
}

fn edges(vertices: &[[f64; 2]]) -> impl Iterator<Item = (&[f64; 2], &[f64; 2])> {
    vertices.iter().zip(vertices.iter().cycle().skip(1))
}

/// x coordinate where the edge crosses the horizontal line at `y`
fn crossing(a: &[f64; 2], b: &[f64; 2], y: f64) -> Option<f64> {
    if (a[1] > y) == (b[1] > y) {
        return None;
    }
    // Same result for an edge regardless of its winding direction
    let (lo, hi) = if a[1] < b[1] { (a, b) } else { (b, a) };
    Some(lo[0] + (y - lo[1]) * (hi[0] - lo[0]) / (hi[1] - lo[1]))
}
