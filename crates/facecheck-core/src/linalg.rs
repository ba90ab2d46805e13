//! Minimal dense 2×2 kernel for similarity estimation.
//!
//! Only what the Umeyama estimator needs: column means, demeaning, cross
//! covariance, determinant/inverse and a closed-form 2×2 SVD. Computation is
//! done in `f64`; callers convert at the boundary.

/// Relative threshold under which a singular value counts as zero.
const RANK_TOLERANCE: f64 = 1e-9;

/// Row-major 2×2 matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat2(pub [[f64; 2]; 2]);

impl Mat2 {
    pub const IDENTITY: Mat2 = Mat2([[1.0, 0.0], [0.0, 1.0]]);

    pub fn new(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self([[a, b], [c, d]])
    }

    pub fn diag(d0: f64, d1: f64) -> Self {
        Self([[d0, 0.0], [0.0, d1]])
    }

    /// Rotation by `theta` radians (counter-clockwise in a y-up frame).
    pub fn rotation(theta: f64) -> Self {
        let (s, c) = theta.sin_cos();
        Self([[c, -s], [s, c]])
    }

    pub fn transpose(&self) -> Self {
        let m = self.0;
        Self([[m[0][0], m[1][0]], [m[0][1], m[1][1]]])
    }

    pub fn det(&self) -> f64 {
        let m = self.0;
        m[0][0] * m[1][1] - m[0][1] * m[1][0]
    }

    pub fn trace(&self) -> f64 {
        self.0[0][0] + self.0[1][1]
    }

    pub fn mul(&self, other: &Mat2) -> Mat2 {
        let a = self.0;
        let b = other.0;
        let mut out = [[0.0; 2]; 2];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = a[i][0] * b[0][j] + a[i][1] * b[1][j];
            }
        }
        Mat2(out)
    }

    pub fn mul_vec(&self, v: [f64; 2]) -> [f64; 2] {
        let m = self.0;
        [
            m[0][0] * v[0] + m[0][1] * v[1],
            m[1][0] * v[0] + m[1][1] * v[1],
        ]
    }

    pub fn scaled(&self, k: f64) -> Mat2 {
        let m = self.0;
        Mat2([[m[0][0] * k, m[0][1] * k], [m[1][0] * k, m[1][1] * k]])
    }

    /// Copy with column `col` negated.
    pub fn negate_column(&self, col: usize) -> Mat2 {
        let mut m = self.0;
        m[0][col] = -m[0][col];
        m[1][col] = -m[1][col];
        Mat2(m)
    }

    /// Inverse, or `None` when the determinant is zero or not finite.
    pub fn inverse(&self) -> Option<Mat2> {
        let det = self.det();
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let m = self.0;
        let inv = 1.0 / det;
        Some(Mat2([
            [m[1][1] * inv, -m[0][1] * inv],
            [-m[1][0] * inv, m[0][0] * inv],
        ]))
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().flatten().all(|v| v.is_finite())
    }
}

/// Singular value decomposition `M = U · diag(S) · Vᵀ` of a 2×2 matrix.
#[derive(Debug, Clone, Copy)]
pub struct Svd2 {
    pub u: Mat2,
    /// Non-negative, descending.
    pub singular: [f64; 2],
    /// `Vᵀ`. `V` is always a proper rotation; any reflection is carried by `U`.
    pub vt: Mat2,
}

impl Svd2 {
    /// Numerical rank: singular values above `RANK_TOLERANCE · s_max`.
    pub fn rank(&self) -> usize {
        let s_max = self.singular[0];
        if s_max <= 0.0 || !s_max.is_finite() {
            return 0;
        }
        let tol = s_max * RANK_TOLERANCE;
        self.singular.iter().filter(|&&s| s > tol).count()
    }
}

/// Closed-form 2×2 SVD.
///
/// Any real 2×2 matrix factors as `R(φ) · diag(sx, sy) · R(θ)` with `sy`
/// possibly negative. A negative `sy` is folded into `U` by negating its second
/// column, which keeps the singular values non-negative and `V` a rotation.
pub fn svd2(m: &Mat2) -> Svd2 {
    let [[a, b], [c, d]] = m.0;
    let e = (a + d) / 2.0;
    let f = (a - d) / 2.0;
    let g = (c + b) / 2.0;
    let h = (c - b) / 2.0;

    let q = e.hypot(h);
    let r = f.hypot(g);
    let sx = q + r;
    let sy = q - r;

    let a1 = g.atan2(f);
    let a2 = h.atan2(e);
    let theta = (a2 - a1) / 2.0;
    let phi = (a2 + a1) / 2.0;

    let mut u = Mat2::rotation(phi);
    let vt = Mat2::rotation(theta);
    let sy = if sy < 0.0 {
        u = u.negate_column(1);
        -sy
    } else {
        sy
    };

    Svd2 {
        u,
        singular: [sx, sy],
        vt,
    }
}

pub fn column_mean(points: &[[f64; 2]]) -> [f64; 2] {
    if points.is_empty() {
        return [0.0, 0.0];
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
    [sx / n, sy / n]
}

pub fn demean(points: &[[f64; 2]], mean: [f64; 2]) -> Vec<[f64; 2]> {
    points
        .iter()
        .map(|p| [p[0] - mean[0], p[1] - mean[1]])
        .collect()
}

/// Unbiased (n − 1) variance of each column.
pub fn sample_column_variance(points: &[[f64; 2]]) -> [f64; 2] {
    if points.len() < 2 {
        return [0.0, 0.0];
    }
    let mean = column_mean(points);
    let denom = (points.len() - 1) as f64;
    let (vx, vy) = points.iter().fold((0.0, 0.0), |(vx, vy), p| {
        (vx + (p[0] - mean[0]).powi(2), vy + (p[1] - mean[1]).powi(2))
    });
    [vx / denom, vy / denom]
}

/// `(Aᵀ · B) / n` for two demeaned point sets of equal length.
pub fn cross_covariance(a: &[[f64; 2]], b: &[[f64; 2]]) -> Mat2 {
    let n = a.len().min(b.len());
    if n == 0 {
        return Mat2::new(0.0, 0.0, 0.0, 0.0);
    }
    let mut out = [[0.0; 2]; 2];
    for (pa, pb) in a.iter().zip(b.iter()) {
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell += pa[i] * pb[j];
            }
        }
    }
    Mat2(out).scaled(1.0 / n as f64)
}
