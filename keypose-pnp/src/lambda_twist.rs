//! Minimal P3P solver.
//!
//! Implementation of
//! "Lambda Twist: An Accurate Fast Robust Perspective Three Point (P3P) Solver".
//! Persson, M. and Nordberg, K. ECCV 2018.
//! Reference implementation available on the [author github repository][lambda-twist-github].
//!
//! [lambda-twist-github]: https://github.com/midjji/lambdatwist-p3p

use arrayvec::ArrayVec;
use float_ord::FloatOrd;
use keypose_core::{
    nalgebra::{Matrix3, Rotation3, Unit, Vector3},
    sample_consensus::{Estimator, Model},
    ObjectToCamera, Pose, PoseCorrespondence,
};
use num_traits::Float;

type Mat3 = Matrix3<f64>;
type Vec3 = Vector3<f64>;

/// Object points closer than this (squared, in object units) are treated as coincident.
const DEGENERATE_EPSILON: f64 = 1e-12;

/// Lambda Twist P3P with a fourth correspondence used to pick one of the
/// up to four poses that explain the first three.
///
/// This struct is marked as `#[non_exhaustive]` to allow the backwards-compatible addition
/// of new fields.
#[derive(Copy, Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct LambdaTwist {
    /// Number of Gauss-Newton iterations ran on the depths of each solution.
    /// The paper notes that it rarely improves after two iterations.
    pub gauss_newton_iterations: usize,
    /// Number of iterations spent converging on a proper rotation matrix.
    pub rotation_convergence_iterations: usize,
    /// The epsilon on which convergence is considered achieved for converging on a proper rotation.
    pub rotation_convergence_epsilon: f64,
}

impl LambdaTwist {
    /// Creates a default lambda twist with 5 iterations of Gauss-Newton.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the [`LambdaTwist::gauss_newton_iterations`].
    #[must_use]
    pub fn gauss_newton_iterations(self, gauss_newton_iterations: usize) -> Self {
        Self {
            gauss_newton_iterations,
            ..self
        }
    }

    /// Sets the [`LambdaTwist::rotation_convergence_iterations`].
    #[must_use]
    pub fn rotation_convergence_iterations(self, rotation_convergence_iterations: usize) -> Self {
        Self {
            rotation_convergence_iterations,
            ..self
        }
    }

    /// Sets the [`LambdaTwist::rotation_convergence_epsilon`].
    #[must_use]
    pub fn rotation_convergence_epsilon(self, rotation_convergence_epsilon: f64) -> Self {
        Self {
            rotation_convergence_epsilon,
            ..self
        }
    }

    /// Computes the 0 to 4 poses satisfying `lambda_i * y_i = R * x_i + t` for three
    /// correspondences, where `x_i` are the object points, `y_i` the bearings and `lambda_i`
    /// the depths along the bearings.
    ///
    /// Degenerate triplets (coincident or collinear object points) yield no pose.
    pub fn solve(&self, samples: [PoseCorrespondence; 3]) -> ArrayVec<ObjectToCamera, 4> {
        let points = samples.map(|s| s.object.0);
        let bearings: [Unit<Vec3>; 3] = samples.map(|s| s.keypoint.bearing());

        let d12 = points[0] - points[1];
        let d13 = points[0] - points[2];
        let d23 = points[1] - points[2];
        let d12xd13 = d12.cross(&d13);
        if d12xd13.norm_squared() < DEGENERATE_EPSILON {
            return ArrayVec::new();
        }

        // Squared object distances and bearing cosines.
        let sides = Sides {
            a12: d12.norm_squared(),
            a13: d13.norm_squared(),
            a23: d23.norm_squared(),
            b12: -2.0 * bearings[0].dot(&bearings[1]),
            b13: -2.0 * bearings[2].dot(&bearings[0]),
            b23: -2.0 * bearings[1].dot(&bearings[2]),
        };

        #[rustfmt::skip]
        let x_mat = Mat3::new(
            d12[0], d13[0], d12xd13[0],
            d12[1], d13[1], d12xd13[1],
            d12[2], d13[2], d12xd13[2],
        );
        let x_inv = match x_mat.try_inverse() {
            Some(x_inv) => x_inv,
            None => return ArrayVec::new(),
        };

        sides
            .depths()
            .into_iter()
            .map(|lambda| sides.refine(lambda, self.gauss_newton_iterations))
            .filter_map(|lambda| {
                let ry1 = lambda[0] * bearings[0].into_inner();
                let ry2 = lambda[1] * bearings[1].into_inner();
                let ry3 = lambda[2] * bearings[2].into_inner();

                let yd1 = ry1 - ry2;
                let yd2 = ry1 - ry3;
                let yd1xd2 = yd1.cross(&yd2);

                #[rustfmt::skip]
                let y_mat = Mat3::new(
                    yd1[0], yd2[0], yd1xd2[0],
                    yd1[1], yd2[1], yd1xd2[1],
                    yd1[2], yd2[2], yd1xd2[2],
                );

                let rot = y_mat * x_inv;
                if !rot.iter().all(|v| v.is_finite()) {
                    return None;
                }
                let rotation = Rotation3::from_matrix_eps(
                    &rot,
                    self.rotation_convergence_epsilon,
                    self.rotation_convergence_iterations,
                    Rotation3::identity(),
                );
                let translation = ry1 - rotation * points[0].coords;
                Some(ObjectToCamera::from_parts(translation, rotation))
            })
            .collect()
    }
}

impl Default for LambdaTwist {
    fn default() -> Self {
        Self {
            gauss_newton_iterations: 5,
            rotation_convergence_iterations: 100,
            rotation_convergence_epsilon: 1e-12,
        }
    }
}

impl Estimator<PoseCorrespondence> for LambdaTwist {
    type Model = ObjectToCamera;
    type ModelIter = Option<ObjectToCamera>;
    /// Three points to solve, one to disambiguate.
    const MIN_SAMPLES: usize = 4;

    fn estimate<I>(&self, mut data: I) -> Self::ModelIter
    where
        I: Iterator<Item = PoseCorrespondence> + Clone,
    {
        let samples = [data.next()?, data.next()?, data.next()?];
        let check = data.next()?;
        self.solve(samples)
            .into_iter()
            .filter(|pose| pose.residual(&check).is_finite())
            .min_by_key(|pose| FloatOrd(pose.residual(&check)))
    }
}

/// The triangle formed by three object points, seen through three bearings.
///
/// `aij` is the squared distance between object points `i` and `j`,
/// `bij` is `-2` times the cosine between bearings `i` and `j`.
#[derive(Copy, Clone, Debug)]
struct Sides {
    a12: f64,
    a13: f64,
    a23: f64,
    b12: f64,
    b13: f64,
    b23: f64,
}

impl Sides {
    /// Candidate depth triplets along the three bearings.
    fn depths(&self) -> ArrayVec<Vec3, 4> {
        let Sides {
            a12,
            a13,
            a23,
            b12,
            b13,
            b23,
        } = *self;
        let c12 = -0.5 * b12;
        let c31 = -0.5 * b13;
        let c23 = -0.5 * b23;
        let blob = c12 * c23 * c31 - 1.0;

        // Squared sines between bearings.
        let s12_sqr = 1.0 - c12 * c12;
        let s23_sqr = 1.0 - c23 * c23;
        let s31_sqr = 1.0 - c31 * c31;

        // Cubic coefficients, equation (10) of the paper.
        let p3 = a13 * (a23 * s31_sqr - a13 * s23_sqr);
        let p2 = 2.0 * blob * a23 * a13
            + a13 * (2.0 * a12 + a13) * s23_sqr
            + a23 * (a23 - a12) * s31_sqr;
        let p1 = a23 * (a13 - a23) * s12_sqr
            - a12 * a12 * s23_sqr
            - 2.0 * a12 * (blob * a23 + a13 * s23_sqr);
        let p0 = a12 * (a12 * s23_sqr - a23 * s12_sqr);

        let g = cube_root(p2 / p3, p1 / p3, p0 / p3);

        // The singular matrix D0.
        let d0_00 = a23 * (1.0 - g);
        let d0_01 = -(a23 * c12);
        let d0_02 = a23 * c31 * g;
        let d0_11 = a23 - a12 + a13 * g;
        let d0_12 = -c23 * (a13 * g - a12);
        let d0_22 = g * (a13 - a23) - a12;
        #[rustfmt::skip]
        let d0 = Mat3::new(
            d0_00, d0_01, d0_02,
            d0_01, d0_11, d0_12,
            d0_02, d0_12, d0_22,
        );

        let (eig_vectors, eig_values) = eigen_decomposition_singular(d0);
        let eigen_ratio = (0.0_f64.max(-eig_values[1] / eig_values[0])).sqrt();

        let mut lambdas: ArrayVec<Vec3, 4> = ArrayVec::new();
        for ratio in [eigen_ratio, -eigen_ratio] {
            // Equation (15) of the paper.
            let w2 = 1.0 / (ratio * eig_vectors.m12 - eig_vectors.m11);
            let w0 = w2 * (eig_vectors.m21 - ratio * eig_vectors.m22);
            let w1 = w2 * (eig_vectors.m31 - ratio * eig_vectors.m32);

            let a = 1.0 / ((a13 - a12) * w1 * w1 - a12 * b13 * w1 - a12);
            let b = a * (a13 * b12 * w1 - a12 * b13 * w0 - 2.0 * w0 * w1 * (a12 - a13));
            let c = a * ((a13 - a12) * w0 * w0 + a13 * b12 * w0 + a13);

            let (real, tau1, tau2) = root2real(b, c);
            if !real {
                continue;
            }
            for tau in [tau1, tau2] {
                if tau <= 0.0 {
                    continue;
                }
                // Equation (16) of the paper.
                let d = a23 / (tau * (b23 + tau) + 1.0);
                if d > 0.0 {
                    let l2 = d.sqrt();
                    let l3 = tau * l2;
                    let l1 = w0 * l2 + w1 * l3;
                    if l1 >= 0.0 {
                        lambdas.push(Vec3::new(l1, l2, l3));
                    }
                }
            }
        }
        lambdas
    }

    fn residual(&self, l: &Vec3) -> Vec3 {
        let (l1, l2, l3) = (l.x, l.y, l.z);
        Vec3::new(
            l1 * l1 + l2 * l2 + self.b12 * l1 * l2 - self.a12,
            l1 * l1 + l3 * l3 + self.b13 * l1 * l3 - self.a13,
            l2 * l2 + l3 * l3 + self.b23 * l2 * l3 - self.a23,
        )
    }

    /// Gauss-Newton refinement of a depth triplet, stopping as soon as a step does not improve it.
    fn refine(&self, lambda: Vec3, iterations: usize) -> Vec3 {
        let mut lambda = lambda;
        let mut res = self.residual(&lambda);
        for _ in 0..iterations {
            if l1_norm(res) < 1e-10 {
                break;
            }
            let (l1, l2, l3) = (lambda.x, lambda.y, lambda.z);
            let dr1dl1 = 2.0 * l1 + self.b12 * l2;
            let dr1dl2 = 2.0 * l2 + self.b12 * l1;
            let dr2dl1 = 2.0 * l1 + self.b13 * l3;
            let dr2dl3 = 2.0 * l3 + self.b13 * l1;
            let dr3dl2 = 2.0 * l2 + self.b23 * l3;
            let dr3dl3 = 2.0 * l3 + self.b23 * l2;
            let det = 1.0 / (-dr1dl1 * dr2dl3 * dr3dl2 - dr1dl2 * dr2dl1 * dr3dl3);

            #[rustfmt::skip]
            let adjugate = Mat3::new(
                -dr2dl3 * dr3dl2, -dr1dl2 * dr3dl3,  dr1dl2 * dr2dl3,
                -dr2dl1 * dr3dl3,  dr1dl1 * dr3dl3, -dr1dl1 * dr2dl3,
                 dr2dl1 * dr3dl2, -dr1dl1 * dr3dl2, -dr1dl2 * dr2dl1,
            );
            let candidate = lambda - det * (adjugate * res);
            let candidate_res = self.residual(&candidate);
            if l1_norm(candidate_res) > l1_norm(res) {
                break;
            }
            lambda = candidate;
            res = candidate_res;
        }
        lambda
    }
}

#[inline]
fn l1_norm(v: Vec3) -> f64 {
    v.x.abs() + v.y.abs() + v.z.abs()
}

/// Real roots of `r^2 + b*r + c = 0`, computed without cancellation.
/// The flag is `false` when the roots are complex.
fn root2real(b: f64, c: f64) -> (bool, f64, f64) {
    let discriminant = b * b - 4.0 * c;
    if discriminant < 0.0 {
        let root = 0.5 * b;
        (false, root, root)
    } else if b < 0.0 {
        let y = Float::sqrt(discriminant);
        (true, 0.5 * (-b + y), 0.5 * (-b - y))
    } else {
        let y = Float::sqrt(discriminant);
        (true, 2.0 * c / (-b + y), 2.0 * c / (-b - y))
    }
}

/// A single root of `r^3 + b*r^2 + c*r + d = 0` with as high a derivative as possible.
///
/// Newton-Raphson from an initial guess chosen by the shape of the cubic: where it
/// is monotonic, start at the point of minimal derivative; otherwise start at the
/// outermost root of a second order approximation around a stationary point.
#[allow(clippy::many_single_char_names)]
fn cube_root(b: f64, c: f64, d: f64) -> f64 {
    let mut r0;
    if b * b >= 3.0 * c {
        // Two stationary points t1 < t2.
        let v = (b * b - 3.0 * c).sqrt();
        let t1 = (-b - v) / 3.0;
        let k = ((t1 + b) * t1 + c) * t1 + d;
        if k > 0.0 {
            r0 = t1 - (-k / (3.0 * t1 + b)).sqrt();
        } else {
            let t2 = (-b + v) / 3.0;
            let k = ((t2 + b) * t2 + c) * t2 + d;
            r0 = t2 + (-k / (3.0 * t2 + b)).sqrt();
        }
    } else {
        r0 = -b / 3.0;
        if ((3.0 * r0 + 2.0 * b) * r0 + c).abs() < 1e-4 {
            r0 += 1.0;
        }
    }

    // At least 7 and at most 50 Newton steps.
    for step in 0..50 {
        let fx = ((r0 + b) * r0 + c) * r0 + d;
        if step >= 7 && fx.abs() <= 1e-13 {
            break;
        }
        let fpx = (3.0 * r0 + 2.0 * b) * r0 + c;
        r0 -= fx / fpx;
    }
    r0
}

/// Eigenvectors (as columns) and eigenvalues of a singular symmetric matrix,
/// sorted by decreasing eigenvalue magnitude. The last eigenvalue is zero.
fn eigen_decomposition_singular(x: Mat3) -> (Mat3, Vec3) {
    #[rustfmt::skip]
    let mut v3 = Vec3::new(
        x[1] * x[5] - x[2] * x[4],
        x[2] * x[3] - x[5] * x[0],
        x[4] * x[0] - x[1] * x[3],
    );
    v3.normalize_mut();

    let x12_sqr = x.m12 * x.m12;
    let b = -x.m11 - x.m22 - x.m33;
    let c = -x12_sqr - x.m13 * x.m13 - x.m23 * x.m23 + x.m11 * (x.m22 + x.m33) + x.m22 * x.m33;
    let (_, mut e1, mut e2) = root2real(b, c);
    if e1.abs() < e2.abs() {
        core::mem::swap(&mut e1, &mut e2);
    }

    let mx0011 = -x.m11 * x.m22;
    let prec_0 = x.m12 * x.m23 - x.m13 * x.m22;
    let prec_1 = x.m12 * x.m13 - x.m11 * x.m23;
    let eigen_vector = |e: f64| {
        let tmp = 1.0 / (e * (x.m11 + x.m22) + mx0011 - e * e + x12_sqr);
        let a1 = -(e * x.m13 + prec_0) * tmp;
        let a2 = -(e * x.m23 + prec_1) * tmp;
        let rnorm = 1.0 / (a1 * a1 + a2 * a2 + 1.0).sqrt();
        Vec3::new(a1 * rnorm, a2 * rnorm, rnorm)
    };
    let v1 = eigen_vector(e1);
    let v2 = eigen_vector(e2);

    (
        Mat3::from_columns(&[v1, v2, v3]),
        Vec3::new(e1, e2, 0.0),
    )
}
