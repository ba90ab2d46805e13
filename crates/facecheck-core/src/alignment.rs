//! Face alignment via Umeyama similarity estimation.
//!
//! Detected landmarks are mapped onto the ArcFace reference template scaled to
//! a 224×224 crop, and the source raster is resampled through the estimated
//! transform.

use crate::linalg::{self, Mat2};
use crate::sampler::{self, Image, ImageError, ImageView, ALIGNED_SIZE};
use crate::types::{Landmarks, Point};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ArcFace reference landmarks for a 224×224 output (the 112×112 set doubled).
pub const FACE_TEMPLATE_224: [Point; 5] = [
    Point::new(38.2946 * 2.0, 51.6963 * 2.0), // left eye
    Point::new(73.5318 * 2.0, 51.5014 * 2.0), // right eye
    Point::new(56.0252 * 2.0, 71.7366 * 2.0), // nose
    Point::new(41.5493 * 2.0, 92.3655 * 2.0), // left mouth
    Point::new(70.7299 * 2.0, 92.2041 * 2.0), // right mouth
];

/// Applied to each column variance before it divides the singular-value sum.
/// Tuned for five landmarks; kept for every point count.
const VARIANCE_BIAS_CORRECTION: f64 = 4.0 / 5.0;

/// `det(cov) ≤ DEGENERACY_RATIO · (trace(cov)/2)²` means the points are
/// (nearly) collinear or coincident.
const DEGENERACY_RATIO: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignError {
    #[error("landmark {index} is not finite")]
    NonFinite { index: usize },
    #[error("landmarks are collinear or coincident")]
    Degenerate,
    #[error("cross-covariance has rank 0; transform is undefined")]
    RankDeficient,
    #[error("point count mismatch: {src} source vs {dst} destination")]
    PointCount { src: usize, dst: usize },
    #[error("warp failed: {0}")]
    Image(#[from] ImageError),
}

/// 3×3 similarity transform in row-vector convention: `[x' y' 1] = [x y 1] · M`.
///
/// The top-left 2×2 block is the transposed linear part `(s·R)ᵀ` and the last
/// row holds the translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityTransform {
    matrix: [[f32; 3]; 3],
}

impl SimilarityTransform {
    pub fn identity() -> Self {
        Self {
            matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    pub fn from_matrix(matrix: [[f32; 3]; 3]) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> [[f32; 3]; 3] {
        self.matrix
    }

    pub fn translation(&self) -> Point {
        Point::new(self.matrix[2][0], self.matrix[2][1])
    }

    pub fn scale(&self) -> f32 {
        self.matrix[0][0].hypot(self.matrix[0][1])
    }

    /// Rotation angle in radians.
    pub fn rotation(&self) -> f32 {
        self.matrix[0][1].atan2(self.matrix[0][0])
    }

    pub fn apply(&self, p: Point) -> Point {
        let m = &self.matrix;
        Point::new(
            p.x * m[0][0] + p.y * m[1][0] + m[2][0],
            p.x * m[0][1] + p.y * m[1][1] + m[2][1],
        )
    }

    pub fn is_finite(&self) -> bool {
        self.matrix.iter().flatten().all(|v| v.is_finite())
    }
}

/// Least-squares similarity transform mapping `src` onto `dst` (Umeyama).
///
/// Column 1 of both `U` and `V` is negated before the rank branches; with the
/// rotation-only `V` produced by [`linalg::svd2`] the result equals the
/// textbook `U·diag(d)·Vᵀ`.
pub fn estimate_similarity(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    estimate_scale: bool,
) -> Result<SimilarityTransform, AlignError> {
    if src.len() != dst.len() || src.is_empty() {
        return Err(AlignError::PointCount {
            src: src.len(),
            dst: dst.len(),
        });
    }

    let src_mean = linalg::column_mean(src);
    let dst_mean = linalg::column_mean(dst);
    let src_demean = linalg::demean(src, src_mean);
    let dst_demean = linalg::demean(dst, dst_mean);

    let cov = linalg::cross_covariance(&dst_demean, &src_demean);
    let d = if cov.det() < 0.0 { [1.0, -1.0] } else { [1.0, 1.0] };

    let svd = linalg::svd2(&cov);
    let u = svd.u.negate_column(1);
    let v = svd.vt.transpose().negate_column(1);

    let rotation = match svd.rank() {
        0 => return Err(AlignError::RankDeficient),
        1 => {
            if u.det() * v.det() > 0.0 {
                u.mul(&v)
            } else {
                u.mul(&Mat2::diag(1.0, -1.0)).mul(&v)
            }
        }
        _ => u.mul(&Mat2::diag(d[0], d[1])).mul(&v),
    };

    let scale = if estimate_scale {
        let var = linalg::sample_column_variance(&src_demean);
        let total = (var[0] + var[1]) * VARIANCE_BIAS_CORRECTION;
        if total <= 0.0 || !total.is_finite() {
            return Err(AlignError::RankDeficient);
        }
        (svd.singular[0] * d[0] + svd.singular[1] * d[1]) / total
    } else {
        1.0
    };

    let linear = rotation.scaled(scale);
    let moved = linear.mul_vec(src_mean);
    let t = [dst_mean[0] - moved[0], dst_mean[1] - moved[1]];

    let l = linear.0;
    let matrix = [
        [l[0][0] as f32, l[1][0] as f32, 0.0],
        [l[0][1] as f32, l[1][1] as f32, 0.0],
        [t[0] as f32, t[1] as f32, 1.0],
    ];
    let transform = SimilarityTransform { matrix };
    if !transform.is_finite() {
        return Err(AlignError::RankDeficient);
    }
    Ok(transform)
}

/// Transform taking detected landmarks onto [`FACE_TEMPLATE_224`].
pub fn norm_crop(landmarks: &Landmarks) -> Result<SimilarityTransform, AlignError> {
    if let Some(index) = landmarks.points().iter().position(|p| !p.is_finite()) {
        return Err(AlignError::NonFinite { index });
    }

    let src = landmarks.to_f64();
    let centred = linalg::demean(&src, linalg::column_mean(&src));
    let spread = linalg::cross_covariance(&centred, &centred);
    let half_trace = spread.trace() / 2.0;
    if spread.det() <= DEGENERACY_RATIO * half_trace * half_trace {
        return Err(AlignError::Degenerate);
    }

    let dst = FACE_TEMPLATE_224.map(|p| [p.x as f64, p.y as f64]);
    let transform = estimate_similarity(&src, &dst, true)?;
    tracing::debug!(
        scale = transform.scale(),
        rotation = transform.rotation(),
        "estimated alignment transform"
    );
    Ok(transform)
}

/// Estimate the alignment for `landmarks` and warp `view` into a 224×224 crop.
pub fn align_face(
    view: &ImageView<'_>,
    landmarks: &Landmarks,
) -> Result<(Image, SimilarityTransform), AlignError> {
    let transform = norm_crop(landmarks)?;
    let crop = sampler::warp_affine(view, &transform, ALIGNED_SIZE, ALIGNED_SIZE)?;
    Ok((crop, transform))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moved_template(scale: f32, theta: f32, tx: f32, ty: f32) -> Landmarks {
        let (s, c) = theta.sin_cos();
        Landmarks(FACE_TEMPLATE_224.map(|p| {
            Point::new(
                scale * (p.x * c - p.y * s) + tx,
                scale * (p.x * s + p.y * c) + ty,
            )
        }))
    }

    #[test]
    fn test_template_gives_identity() {
        let t = norm_crop(&Landmarks(FACE_TEMPLATE_224)).unwrap();
        let m = t.matrix();
        let id = SimilarityTransform::identity().matrix();
        for i in 0..3 {
            for j in 0..3 {
                assert!((m[i][j] - id[i][j]).abs() < 1e-3, "m = {m:?}");
            }
        }
        assert!((t.scale() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_recovers_known_similarity() {
        let lms = moved_template(1.1, 0.2, 20.0, -10.0);
        let t = norm_crop(&lms).unwrap();

        assert!((t.scale() - 1.0 / 1.1).abs() < 1e-3, "scale {}", t.scale());
        assert!((t.rotation() + 0.2).abs() < 1e-3, "rotation {}", t.rotation());
        for (src, dst) in lms.points().iter().zip(FACE_TEMPLATE_224.iter()) {
            let p = t.apply(*src);
            assert!((p.x - dst.x).abs() < 1e-3 && (p.y - dst.y).abs() < 1e-3);
        }
    }

    #[test]
    fn test_without_scale_keeps_unit_scale() {
        let lms = moved_template(2.0, 0.0, 0.0, 0.0);
        let src = lms.to_f64();
        let dst = FACE_TEMPLATE_224.map(|p| [p.x as f64, p.y as f64]);
        let t = estimate_similarity(&src, &dst, false).unwrap();
        assert!((t.scale() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_coincident_points_are_rank_deficient() {
        let src = [[5.0, 5.0]; 5];
        let dst = FACE_TEMPLATE_224.map(|p| [p.x as f64, p.y as f64]);
        assert_eq!(
            estimate_similarity(&src, &dst, true),
            Err(AlignError::RankDeficient)
        );
    }

    #[test]
    fn test_collinear_rank_one_branch_is_finite() {
        let src: Vec<[f64; 2]> = (0..5).map(|i| [i as f64 * 10.0, 0.0]).collect();
        let dst = FACE_TEMPLATE_224.map(|p| [p.x as f64, p.y as f64]);
        let t = estimate_similarity(&src, &dst, true).unwrap();
        assert!(t.is_finite());
    }

    #[test]
    fn test_point_count_mismatch() {
        let dst = FACE_TEMPLATE_224.map(|p| [p.x as f64, p.y as f64]);
        assert_eq!(
            estimate_similarity(&[[0.0, 0.0]], &dst, true),
            Err(AlignError::PointCount { src: 1, dst: 5 })
        );
    }

    #[test]
    fn test_norm_crop_rejects_collinear() {
        let lms = Landmarks(std::array::from_fn(|i| {
            Point::new(10.0 + i as f32 * 5.0, 20.0 + i as f32 * 5.0)
        }));
        assert_eq!(norm_crop(&lms), Err(AlignError::Degenerate));
    }

    #[test]
    fn test_norm_crop_rejects_nan() {
        let mut pts = FACE_TEMPLATE_224;
        pts[2].y = f32::NAN;
        assert_eq!(
            norm_crop(&Landmarks(pts)),
            Err(AlignError::NonFinite { index: 2 })
        );
    }

    #[test]
    fn test_align_and_warp_roundtrip() {
        // Paint a distinct 9x9 patch at every moved landmark, then check the
        // aligned crop shows each colour at the template position.
        let lms = moved_template(1.1, 0.2, 20.0, -10.0);
        let colours = [
            [250, 10, 10],
            [10, 250, 10],
            [10, 10, 250],
            [250, 250, 10],
            [10, 250, 250],
        ];
        let mut img = Image::new(320, 320);
        for (p, colour) in lms.points().iter().zip(colours.iter()) {
            let (cx, cy) = (p.x.round() as i32, p.y.round() as i32);
            for y in cy - 4..=cy + 4 {
                for x in cx - 4..=cx + 4 {
                    img.put_pixel(x as u32, y as u32, *colour);
                }
            }
        }

        let (crop, _) = align_face(&img.view().unwrap(), &lms).unwrap();
        assert_eq!((crop.width(), crop.height()), (224, 224));
        for (t, colour) in FACE_TEMPLATE_224.iter().zip(colours.iter()) {
            let got = crop.pixel(t.x.round() as u32, t.y.round() as u32);
            assert_eq!(got, *colour, "template point {t:?}");
        }
        // Far from any landmark stays black
        assert_eq!(crop.pixel(2, 2), [0, 0, 0]);
    }
}
