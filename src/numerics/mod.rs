//! Shared numerical kernels: piecewise-linear interpolation and two small
//! bounded minimizers used by the MPC dispatcher and the offline parameter
//! estimators.
//!
//! The minimizers sit behind a single [`minimize`] entry point taking the
//! objective, a start point, optional box bounds and a [`Method`] tag, and
//! returning an [`OptimizeResult`]. Both are derivative-free at the call
//! site and deterministic for fixed inputs, so identification and MPC runs
//! reproduce exactly.

pub mod tests;

/// Linear interpolation over a sorted support, clamped at both ends.
///
/// `xs` must be sorted ascending and the same length as `ys`. Queries below
/// the first sample return the first value, queries above the last return
/// the last value.
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    if xs.is_empty() {
        return 0.0;
    }
    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[xs.len() - 1] {
        return ys[ys.len() - 1];
    }

    let upper = xs.partition_point(|&v| v < x);
    let (x0, x1) = (xs[upper - 1], xs[upper]);
    let (y0, y1) = (ys[upper - 1], ys[upper]);
    if (x1 - x0).abs() < f64::EPSILON {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Algorithm selector for [`minimize`].
///
/// `NelderMead` is a bound-clamped simplex search suited to low-dimensional
/// problems (single coefficients). `ProjectedGradient` is a forward-difference
/// gradient descent with backtracking line search and projection onto the
/// box, standing in for the quasi-Newton and SQP solvers the estimators and
/// the MPC dispatcher call for in higher dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    NelderMead,
    ProjectedGradient,
}

/// Outcome of a [`minimize`] call.
#[derive(Debug, Clone)]
pub struct OptimizeResult {
    pub x: Vec<f64>,
    pub fun: f64,
    pub iterations: usize,
    pub converged: bool,
    pub message: String,
}

/// Minimizes `f` starting from `x0`, optionally constrained to per-axis
/// `bounds`, using the selected [`Method`].
pub fn minimize<F>(f: F, x0: &[f64], bounds: Option<&[(f64, f64)]>, method: Method) -> OptimizeResult
where
    F: Fn(&[f64]) -> f64,
{
    match method {
        Method::NelderMead => nelder_mead(f, x0, bounds),
        Method::ProjectedGradient => projected_gradient(f, x0, bounds),
    }
}

fn project(x: &mut [f64], bounds: Option<&[(f64, f64)]>) {
    if let Some(bounds) = bounds {
        for (value, (lo, hi)) in x.iter_mut().zip(bounds) {
            *value = value.clamp(*lo, *hi);
        }
    }
}

/// Standard Nelder-Mead simplex with reflection, expansion, contraction and
/// shrink steps. Vertices are clamped to the bounds after every move, which
/// is adequate for the near-interior optima the estimators look for.
fn nelder_mead<F>(f: F, x0: &[f64], bounds: Option<&[(f64, f64)]>) -> OptimizeResult
where
    F: Fn(&[f64]) -> f64,
{
    const ALPHA: f64 = 1.0;
    const GAMMA: f64 = 2.0;
    const RHO: f64 = 0.5;
    const SIGMA: f64 = 0.5;
    const TOL: f64 = 1e-10;

    let n = x0.len();
    let max_iterations = 200 * n.max(1);

    // Initial simplex: the start point plus one perturbed vertex per axis.
    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    let mut start = x0.to_vec();
    project(&mut start, bounds);
    simplex.push(start.clone());
    for i in 0..n {
        let mut vertex = start.clone();
        let step = if vertex[i].abs() > 1e-12 {
            0.05 * vertex[i]
        } else {
            0.00025
        };
        vertex[i] += step;
        project(&mut vertex, bounds);
        simplex.push(vertex);
    }

    let mut values: Vec<f64> = simplex.iter().map(|v| f(v)).collect();
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;

        // Order vertices by objective value.
        let mut order: Vec<usize> = (0..simplex.len()).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        values = order.iter().map(|&i| values[i]).collect();

        let spread = (values[n] - values[0]).abs();
        if spread < TOL {
            return OptimizeResult {
                x: simplex[0].clone(),
                fun: values[0],
                iterations,
                converged: true,
                message: "simplex collapsed".to_string(),
            };
        }

        // Centroid of all vertices except the worst.
        let mut centroid = vec![0.0; n];
        for vertex in simplex.iter().take(n) {
            for (c, v) in centroid.iter_mut().zip(vertex) {
                *c += v / n as f64;
            }
        }

        let worst = simplex[n].clone();
        let reflect = |scale: f64| -> Vec<f64> {
            let mut point: Vec<f64> = centroid
                .iter()
                .zip(&worst)
                .map(|(c, w)| c + scale * (c - w))
                .collect();
            project(&mut point, bounds);
            point
        };

        let reflected = reflect(ALPHA);
        let reflected_value = f(&reflected);

        if reflected_value < values[0] {
            let expanded = reflect(GAMMA);
            let expanded_value = f(&expanded);
            if expanded_value < reflected_value {
                simplex[n] = expanded;
                values[n] = expanded_value;
            } else {
                simplex[n] = reflected;
                values[n] = reflected_value;
            }
        } else if reflected_value < values[n - 1] {
            simplex[n] = reflected;
            values[n] = reflected_value;
        } else {
            let contracted = reflect(-RHO);
            let contracted_value = f(&contracted);
            if contracted_value < values[n] {
                simplex[n] = contracted;
                values[n] = contracted_value;
            } else {
                // Shrink all vertices toward the best one.
                let best = simplex[0].clone();
                for vertex in simplex.iter_mut().skip(1) {
                    for (v, b) in vertex.iter_mut().zip(&best) {
                        *v = b + SIGMA * (*v - b);
                    }
                    project(vertex, bounds);
                }
                for (value, vertex) in values.iter_mut().zip(&simplex).skip(1) {
                    *value = f(vertex);
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..simplex.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    OptimizeResult {
        x: simplex[order[0]].clone(),
        fun: values[order[0]],
        iterations,
        converged: false,
        message: "iteration limit reached".to_string(),
    }
}

/// Projected gradient descent with a forward-difference gradient and an
/// Armijo backtracking line search. Iterates stay inside the box at all
/// times.
fn projected_gradient<F>(f: F, x0: &[f64], bounds: Option<&[(f64, f64)]>) -> OptimizeResult
where
    F: Fn(&[f64]) -> f64,
{
    const MAX_ITERATIONS: usize = 300;
    const GRAD_EPS: f64 = 1e-6;
    const STEP_TOL: f64 = 1e-10;
    const ARMIJO: f64 = 1e-4;

    let mut x = x0.to_vec();
    project(&mut x, bounds);
    let mut fx = f(&x);

    for iteration in 1..=MAX_ITERATIONS {
        // Forward-difference gradient, respecting the upper bound when
        // probing.
        let mut gradient = vec![0.0; x.len()];
        for i in 0..x.len() {
            let mut probe = x.clone();
            let mut h = GRAD_EPS * (1.0 + x[i].abs());
            if let Some(bounds) = bounds {
                if probe[i] + h > bounds[i].1 {
                    h = -h;
                }
            }
            probe[i] += h;
            gradient[i] = (f(&probe) - fx) / h;
        }

        let grad_norm = gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
        if grad_norm < 1e-12 {
            return OptimizeResult {
                x,
                fun: fx,
                iterations: iteration,
                converged: true,
                message: "gradient vanished".to_string(),
            };
        }

        // Backtracking along the projected descent direction.
        let mut step = 1.0 / grad_norm.max(1.0);
        let mut improved = false;
        for _ in 0..40 {
            let mut candidate: Vec<f64> = x
                .iter()
                .zip(&gradient)
                .map(|(xi, gi)| xi - step * gi)
                .collect();
            project(&mut candidate, bounds);

            let moved = candidate
                .iter()
                .zip(&x)
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();
            if moved < STEP_TOL {
                break;
            }

            let candidate_value = f(&candidate);
            if candidate_value <= fx - ARMIJO * grad_norm * moved {
                x = candidate;
                fx = candidate_value;
                improved = true;
                break;
            }
            step *= 0.5;
        }

        if !improved {
            return OptimizeResult {
                x,
                fun: fx,
                iterations: iteration,
                converged: true,
                message: "no further descent".to_string(),
            };
        }
    }

    OptimizeResult {
        x,
        fun: fx,
        iterations: MAX_ITERATIONS,
        converged: false,
        message: "iteration limit reached".to_string(),
    }
}
