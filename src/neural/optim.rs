// projeto: npredict
// file: src/neural/optim.rs
// Conjugate-gradient minimiser with bracketing and Brent line search

use log::debug;
use serde::{Deserialize, Serialize};

use crate::neural::progress::TrainingContext;
use crate::neural::utils::dot;

/// Differentiable error surface over a flat parameter vector.
pub trait Objective: Sync {
    fn n_params(&self) -> usize;

    fn error(&self, params: &[f64]) -> f64;

    /// Writes the gradient into `grad` and returns the error.
    fn gradient(&self, params: &[f64], grad: &mut [f64]) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingStatus {
    /// Error reached the tolerance.
    Converged,
    /// No further progress possible; a local minimum above the tolerance.
    Stalled,
    /// Iteration budget exhausted before reaching the tolerance.
    IterationLimit,
    /// Stopped by the caller's cancellation query.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimConfig {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub min_improvement: f64,
    pub stall_limit: usize,
    pub report_every: usize,
}

impl Default for OptimConfig {
    fn default() -> Self {
        OptimConfig {
            max_iterations: 1000,
            tolerance: 1e-6,
            min_improvement: 1e-9,
            stall_limit: 5,
            report_every: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimOutcome {
    pub params: Vec<f64>,
    pub error: f64,
    pub iterations: usize,
    pub status: TrainingStatus,
    pub history: Vec<f64>,
}

const LINE_SEARCH_ITERS: usize = 30;
const LINE_SEARCH_TOL: f64 = 1e-4;
const CGOLD: f64 = 0.381_966_011_250_105;

/// Polak–Ribière conjugate gradient.
///
/// Cancellation is polled once per iteration; a cancelled run returns the
/// parameters of the last completed iteration.
pub fn conjugate_gradient<O: Objective>(
    objective: &O,
    start: Vec<f64>,
    config: &OptimConfig,
    ctx: &TrainingContext,
) -> OptimOutcome {
    let n = objective.n_params();
    let mut x = start;
    let mut g = vec![0.0; n];
    let mut f = objective.gradient(&x, &mut g);
    let mut history = vec![f];

    let finish = |x: Vec<f64>, f: f64, iterations: usize, status: TrainingStatus, history: Vec<f64>| {
        debug!("CG finished after {} iterations: error {:.8} ({:?})", iterations, f, status);
        OptimOutcome { params: x, error: f, iterations, status, history }
    };

    if f <= config.tolerance {
        return finish(x, f, 0, TrainingStatus::Converged, history);
    }

    let mut d: Vec<f64> = g.iter().map(|v| -v).collect();
    let mut steepest = true;
    let mut alpha_guess = 1.0 / dot(n, &d, &d).sqrt().max(1e-8);
    let mut stalls = 0;
    let mut g_new = vec![0.0; n];

    for iter in 1..=config.max_iterations {
        if ctx.is_cancelled() {
            ctx.report(&format!("Cancelled at iteration {} (error {:.8})", iter - 1, f));
            return finish(x, f, iter - 1, TrainingStatus::Cancelled, history);
        }

        let (alpha, f_line) = line_search(objective, &x, &d, f, alpha_guess);
        if alpha <= 0.0 || f_line >= f {
            if steepest {
                return finish(x, f, iter, TrainingStatus::Stalled, history);
            }
            // conjugate direction lost descent; restart along the gradient
            d.iter_mut().zip(&g).for_each(|(di, gi)| *di = -gi);
            steepest = true;
            alpha_guess = 1.0 / dot(n, &d, &d).sqrt().max(1e-8);
            continue;
        }

        for (xi, di) in x.iter_mut().zip(&d) {
            *xi += alpha * di;
        }
        let f_new = objective.gradient(&x, &mut g_new);
        let improvement = (f - f_new) / f.abs().max(1e-30);
        f = f_new;
        history.push(f);

        if config.report_every > 0 && iter % config.report_every == 0 {
            ctx.report(&format!("Iteration {}: error {:.8}", iter, f));
        }

        if f <= config.tolerance {
            return finish(x, f, iter, TrainingStatus::Converged, history);
        }

        if improvement < config.min_improvement {
            stalls += 1;
            if stalls >= config.stall_limit {
                return finish(x, f, iter, TrainingStatus::Stalled, history);
            }
        } else {
            stalls = 0;
        }

        let gg = dot(n, &g, &g);
        if gg <= 0.0 {
            return finish(x, f, iter, TrainingStatus::Stalled, history);
        }
        let beta = ((dot(n, &g_new, &g_new) - dot(n, &g_new, &g)) / gg).max(0.0);
        for (di, gi) in d.iter_mut().zip(&g_new) {
            *di = -gi + beta * *di;
        }
        steepest = beta == 0.0;
        if dot(n, &d, &g_new) >= 0.0 {
            d.iter_mut().zip(&g_new).for_each(|(di, gi)| *di = -gi);
            steepest = true;
        }
        std::mem::swap(&mut g, &mut g_new);
        alpha_guess = alpha;
    }

    finish(x, f, config.max_iterations, TrainingStatus::IterationLimit, history)
}

fn error_along<O: Objective>(objective: &O, x: &[f64], d: &[f64], t: f64, trial: &mut Vec<f64>) -> f64 {
    trial.clear();
    trial.extend(x.iter().zip(d).map(|(xi, di)| xi + t * di));
    objective.error(trial)
}

/// Returns the step along `d` and the error there, or `(0, f0)` when no
/// decrease could be found.
fn line_search<O: Objective>(objective: &O, x: &[f64], d: &[f64], f0: f64, guess: f64) -> (f64, f64) {
    let mut trial = Vec::with_capacity(x.len());
    let mut eval = |t: f64| error_along(objective, x, d, t, &mut trial);

    let mut b = if guess.is_finite() && guess > 0.0 { guess } else { 1.0 };
    let mut fb = eval(b);
    let mut shrinks = 0;
    while !(fb < f0) {
        b *= 0.2;
        fb = eval(b);
        shrinks += 1;
        if shrinks > 40 {
            return (0.0, f0);
        }
    }

    let mut a = 0.0;
    let mut c = b * 2.0;
    let mut fc = eval(c);
    let mut expansions = 0;
    while fc < fb {
        a = b;
        b = c;
        fb = fc;
        c = b + 1.618_034 * (b - a);
        fc = eval(c);
        expansions += 1;
        if expansions > 50 {
            return (b, fb);
        }
    }

    brent(&mut eval, a, b, c, fb)
}

/// Brent minimisation inside the bracket `a < b < c` with `f(b)` lowest.
fn brent(f: &mut impl FnMut(f64) -> f64, ax: f64, bx: f64, cx: f64, fbx: f64) -> (f64, f64) {
    let (mut a, mut b) = if ax < cx { (ax, cx) } else { (cx, ax) };
    let (mut x, mut w, mut v) = (bx, bx, bx);
    let (mut fx, mut fw, mut fv) = (fbx, fbx, fbx);
    let mut d: f64 = 0.0;
    let mut e: f64 = 0.0;

    for _ in 0..LINE_SEARCH_ITERS {
        let xm = 0.5 * (a + b);
        let tol1 = LINE_SEARCH_TOL * x.abs() + 1e-12;
        let tol2 = 2.0 * tol1;
        if (x - xm).abs() <= tol2 - 0.5 * (b - a) {
            break;
        }

        if e.abs() > tol1 {
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let etemp = e;
            e = d;
            if p.abs() >= (0.5 * q * etemp).abs() || p <= q * (a - x) || p >= q * (b - x) {
                e = if x >= xm { a - x } else { b - x };
                d = CGOLD * e;
            } else {
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = tol1.copysign(xm - x);
                }
            }
        } else {
            e = if x >= xm { a - x } else { b - x };
            d = CGOLD * e;
        }

        let u = if d.abs() >= tol1 { x + d } else { x + tol1.copysign(d) };
        let fu = f(u);
        if fu <= fx {
            if u >= x { a = x } else { b = x }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x { a = u } else { b = u }
            if fu <= fw || w == x {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }

    (x, fx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::progress::CancelToken;
    use approx::assert_relative_eq;

    struct Quadratic;

    impl Objective for Quadratic {
        fn n_params(&self) -> usize {
            4
        }

        fn error(&self, p: &[f64]) -> f64 {
            p.iter().enumerate().map(|(i, v)| (i + 1) as f64 * (v - i as f64).powi(2)).sum()
        }

        fn gradient(&self, p: &[f64], grad: &mut [f64]) -> f64 {
            for (i, v) in p.iter().enumerate() {
                grad[i] = 2.0 * (i + 1) as f64 * (v - i as f64);
            }
            self.error(p)
        }
    }

    struct Rosenbrock;

    impl Objective for Rosenbrock {
        fn n_params(&self) -> usize {
            2
        }

        fn error(&self, p: &[f64]) -> f64 {
            (1.0 - p[0]).powi(2) + 100.0 * (p[1] - p[0] * p[0]).powi(2)
        }

        fn gradient(&self, p: &[f64], grad: &mut [f64]) -> f64 {
            grad[0] = -2.0 * (1.0 - p[0]) - 400.0 * p[0] * (p[1] - p[0] * p[0]);
            grad[1] = 200.0 * (p[1] - p[0] * p[0]);
            self.error(p)
        }
    }

    #[test]
    fn test_quadratic_converges() {
        let config = OptimConfig { tolerance: 1e-12, ..OptimConfig::default() };
        let out = conjugate_gradient(&Quadratic, vec![5.0, -3.0, 0.0, 10.0], &config, &TrainingContext::silent());
        assert_eq!(out.status, TrainingStatus::Converged);
        for (i, v) in out.params.iter().enumerate() {
            assert_relative_eq!(*v, i as f64, epsilon = 1e-5);
        }
        assert!(out.history.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_rosenbrock_reaches_valley_floor() {
        let config = OptimConfig {
            max_iterations: 5000,
            tolerance: 1e-8,
            stall_limit: 50,
            min_improvement: 0.0,
            ..OptimConfig::default()
        };
        let out = conjugate_gradient(&Rosenbrock, vec![-1.2, 1.0], &config, &TrainingContext::silent());
        assert!(out.error < 1e-4, "error {} status {:?}", out.error, out.status);
    }

    #[test]
    fn test_iteration_limit_reported() {
        let config = OptimConfig { max_iterations: 2, tolerance: 0.0, ..OptimConfig::default() };
        let out = conjugate_gradient(&Rosenbrock, vec![-1.2, 1.0], &config, &TrainingContext::silent());
        assert_eq!(out.status, TrainingStatus::IterationLimit);
        assert_eq!(out.iterations, 2);
        assert!(out.error < 24.2);
    }

    #[test]
    fn test_cancel_before_first_iteration() {
        let token = CancelToken::new();
        token.cancel();
        let ctx = TrainingContext::silent().with_cancel(&token);
        let start = vec![5.0, -3.0, 0.0, 10.0];
        let out = conjugate_gradient(&Quadratic, start.clone(), &OptimConfig::default(), &ctx);
        assert_eq!(out.status, TrainingStatus::Cancelled);
        assert_eq!(out.iterations, 0);
        assert_eq!(out.params, start);
    }
}
