// projeto: npredict
// file: src/neural/arma.rs
// ARMA(p, q) fitting by two-stage least squares, residuals and forecasts

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::neural::predict::PredictionResult;
use crate::neural::progress::TrainingContext;
use crate::neural::signal::{is_missing, Signal, MISSING};
use crate::neural::utils::{least_squares, NeuralError};

/// `x[t] = c + Σ φᵢ x[t-i] + Σ θⱼ e[t-j] + e[t]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmaModel {
    p: usize,
    q: usize,
    intercept: f64,
    phi: Vec<f64>,
    theta: Vec<f64>,
    sigma2: f64,
    n_used: usize,
    skipped: usize,
}

/// Residuals of a long autoregression, `None` where the window was
/// incomplete.
fn long_ar_residuals(x: &[f64], m: usize) -> Result<Vec<Option<f64>>, NeuralError> {
    let n = x.len();
    let cols = m + 1;
    let mut design = Vec::new();
    let mut rhs = Vec::new();
    let complete = |t: usize| !is_missing(x[t]) && (1..=m).all(|i| !is_missing(x[t - i]));
    for t in m..n {
        if complete(t) {
            design.push(1.0);
            design.extend((1..=m).map(|i| x[t - i]));
            rhs.push(x[t]);
        }
    }
    if rhs.len() <= cols {
        return Err(NeuralError::Validation(format!(
            "{} complete windows are too few for the order-{} preliminary autoregression", rhs.len(), m
        )));
    }
    let coef = least_squares(rhs.len(), cols, &design, &rhs)?;

    let mut e = vec![None; n];
    for t in m..n {
        if complete(t) {
            let pred = coef[0] + (1..=m).map(|i| coef[i] * x[t - i]).sum::<f64>();
            e[t] = Some(x[t] - pred);
        }
    }
    Ok(e)
}

impl ArmaModel {
    /// Hannan–Rissanen: a long autoregression estimates the innovations,
    /// then one least-squares regression on lagged values and lagged
    /// innovations gives φ and θ. Pure AR models skip the first stage.
    /// Cancellation is polled before each stage.
    pub fn fit(signal: &Signal, p: usize, q: usize, ctx: &TrainingContext) -> Result<Self, NeuralError> {
        if p + q == 0 {
            return Err(NeuralError::Validation("ARMA order must have p + q ≥ 1".to_string()));
        }
        let x = signal.values();
        let n = x.len();

        let m = if q > 0 {
            (p + q + 1).max((2.0 * (n.max(2) as f64).ln()).ceil() as usize)
        } else {
            0
        };
        if n <= m + p + q + 1 {
            return Err(NeuralError::Validation(format!(
                "signal '{}' with {} values is too short for ARMA({}, {})", signal.name(), n, p, q
            )));
        }
        if ctx.is_cancelled() {
            return Err(NeuralError::Validation(format!("ARMA({}, {}) fit cancelled", p, q)));
        }
        let e1 = if q > 0 { long_ar_residuals(x, m)? } else { vec![None; n] };
        debug!("ARMA stage one: long AR order {}", m);
        if q > 0 {
            ctx.report(&format!("long autoregression of order {} done", m));
        }

        let cols = 1 + p + q;
        let first = p.max(if q > 0 { m + q } else { 0 });
        let mut design = Vec::new();
        let mut rhs = Vec::new();
        let mut skipped = 0;
        for t in first..n {
            let lags_ok = !is_missing(x[t]) && (1..=p).all(|i| !is_missing(x[t - i]));
            let innov: Option<Vec<f64>> = (1..=q).map(|j| e1[t - j]).collect();
            match (lags_ok, innov) {
                (true, Some(innov)) => {
                    design.push(1.0);
                    design.extend((1..=p).map(|i| x[t - i]));
                    design.extend(innov);
                    rhs.push(x[t]);
                }
                _ => skipped += 1,
            }
        }
        if rhs.len() <= cols {
            return Err(NeuralError::Validation(format!(
                "only {} complete observations for ARMA({}, {})", rhs.len(), p, q
            )));
        }
        if skipped > 0 {
            ctx.report(&format!("skipped {} incomplete observations", skipped));
        }
        if ctx.is_cancelled() {
            return Err(NeuralError::Validation(format!("ARMA({}, {}) fit cancelled", p, q)));
        }
        let coef = least_squares(rhs.len(), cols, &design, &rhs)?;

        let mut model = ArmaModel {
            p,
            q,
            intercept: coef[0],
            phi: coef[1..=p].to_vec(),
            theta: coef[p + 1..].to_vec(),
            sigma2: 0.0,
            n_used: rhs.len(),
            skipped,
        };
        let resid: Vec<f64> = model.residual_values(x).into_iter().filter(|r| !is_missing(*r)).collect();
        if !resid.is_empty() {
            model.sigma2 = resid.iter().map(|r| r * r).sum::<f64>() / resid.len() as f64;
        }
        if model.phi.iter().map(|v| v.abs()).sum::<f64>() >= 1.0 {
            warn!("⚠️ AR coefficients {:?} may describe a non-stationary process", model.phi);
        }
        info!("📈 ARMA({}, {}) fit on '{}': phi {:?}, theta {:?}, sigma² {:.6}",
              p, q, signal.name(), model.phi, model.theta, model.sigma2);
        ctx.report(&format!("phi {:?}, theta {:?}, sigma² {:.6}", model.phi, model.theta, model.sigma2));
        Ok(model)
    }

    pub fn order(&self) -> (usize, usize) {
        (self.p, self.q)
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn phi(&self) -> &[f64] {
        &self.phi
    }

    pub fn theta(&self) -> &[f64] {
        &self.theta
    }

    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }

    pub fn n_used(&self) -> usize {
        self.n_used
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Process mean `c / (1 - Σφ)`, when defined.
    pub fn mean(&self) -> Option<f64> {
        let denom = 1.0 - self.phi.iter().sum::<f64>();
        if denom.abs() > 1e-12 { Some(self.intercept / denom) } else { None }
    }

    /// One-step residuals by recursion; MISSING for the warm-up values and
    /// wherever the needed lags are absent (the innovation is taken as zero
    /// there when continuing).
    fn residual_values(&self, x: &[f64]) -> Vec<f64> {
        let n = x.len();
        let warm = self.p.max(self.q);
        let mut e = vec![0.0; n];
        let mut out = vec![MISSING; n];
        for t in warm..n {
            if is_missing(x[t]) || (1..=self.p).any(|i| is_missing(x[t - i])) {
                continue;
            }
            let pred = self.one_step(x, &e, t);
            e[t] = x[t] - pred;
            out[t] = e[t];
        }
        out
    }

    fn one_step(&self, x: &[f64], e: &[f64], t: usize) -> f64 {
        let ar: f64 = self.phi.iter().enumerate().map(|(i, c)| c * x[t - i - 1]).sum();
        let ma: f64 = self.theta.iter().enumerate()
            .filter(|(j, _)| t > *j)
            .map(|(j, c)| c * e[t - j - 1])
            .sum();
        self.intercept + ar + ma
    }

    pub fn residuals(&self, signal: &Signal) -> Signal {
        Signal::new(format!("{}_resid", signal.name()), self.residual_values(signal.values()))
    }

    /// ψ-weights of the MA(∞) representation, `ψ₀ = 1`.
    pub fn psi_weights(&self, count: usize) -> Vec<f64> {
        let mut psi = Vec::with_capacity(count);
        for j in 0..count {
            if j == 0 {
                psi.push(1.0);
                continue;
            }
            let ma = if j <= self.q { self.theta[j - 1] } else { 0.0 };
            let ar: f64 = (1..=j.min(self.p)).map(|i| self.phi[i - 1] * psi[j - i]).sum();
            psi.push(ma + ar);
        }
        psi
    }

    /// Forecasts `horizon` values past the end of `history`. With a
    /// confidence percent, bands use the ψ-weight forecast variance and a
    /// Normal quantile.
    pub fn forecast(&self, history: &Signal, horizon: usize, confidence: Option<f64>) -> Result<PredictionResult, NeuralError> {
        if horizon == 0 {
            return Err(NeuralError::Validation("forecast horizon must be at least 1".to_string()));
        }
        if let Some(pct) = confidence {
            if !(pct > 0.0 && pct < 100.0) {
                return Err(NeuralError::Validation(format!(
                    "confidence percent must lie in (0, 100), got {}", pct
                )));
            }
        }
        let x = history.values();
        let n = x.len();
        if n < self.p || x[n - self.p..].iter().any(|v| is_missing(*v)) {
            return Err(NeuralError::Validation(format!(
                "history '{}' needs {} present values at its end", history.name(), self.p
            )));
        }

        let mut ext_x = x.to_vec();
        let mut ext_e: Vec<f64> = self.residual_values(x).into_iter()
            .map(|r| if is_missing(r) { 0.0 } else { r })
            .collect();
        let mut predicted = Vec::with_capacity(horizon);
        for h in 0..horizon {
            let y = self.one_step(&ext_x, &ext_e, n + h);
            predicted.push(y);
            ext_x.push(y);
            ext_e.push(0.0);
        }

        let name = history.name();
        let mut result = PredictionResult {
            start: n,
            prediction: Signal::new(format!("{}_arma", name), predicted.clone()),
            lower: None,
            upper: None,
            confidence: None,
        };

        if let Some(pct) = confidence {
            let z = Normal::new(0.0, 1.0)
                .map_err(|e| NeuralError::Numerical(e.to_string()))?
                .inverse_cdf(0.5 + pct / 200.0);
            let mut cum = 0.0;
            let half: Vec<f64> = self.psi_weights(horizon).iter()
                .map(|w| {
                    cum += w * w;
                    z * (self.sigma2 * cum).sqrt()
                })
                .collect();
            result.lower = Some(Signal::new(
                format!("{}_lower", name),
                predicted.iter().zip(&half).map(|(p, w)| p - w).collect(),
            ));
            result.upper = Some(Signal::new(
                format!("{}_upper", name),
                predicted.iter().zip(&half).map(|(p, w)| p + w).collect(),
            ));
            result.confidence = Some(pct);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::progress::{CancelToken, ChannelSink};
    use approx::assert_relative_eq;
    use crossbeam::channel::unbounded;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal as Gaussian};

    fn silent() -> TrainingContext<'static> {
        TrainingContext::silent()
    }

    fn simulate(n: usize, phi: f64, theta: f64, seed: u64) -> Signal {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Gaussian::new(0.0, 1.0).unwrap();
        let mut x = vec![0.0; n];
        let mut e_prev = 0.0;
        for t in 1..n {
            let e: f64 = noise.sample(&mut rng);
            x[t] = phi * x[t - 1] + e + theta * e_prev;
            e_prev = e;
        }
        Signal::new("sim", x)
    }

    #[test]
    fn test_recovers_ar1_coefficient() {
        let s = simulate(2000, 0.7, 0.0, 7);
        let model = ArmaModel::fit(&s, 1, 0, &silent()).unwrap();
        assert!((model.phi()[0] - 0.7).abs() < 0.08, "phi {}", model.phi()[0]);
        assert!((model.sigma2() - 1.0).abs() < 0.15, "sigma2 {}", model.sigma2());
    }

    #[test]
    fn test_recovers_ma1_coefficient() {
        let s = simulate(3000, 0.0, 0.5, 11);
        let model = ArmaModel::fit(&s, 0, 1, &silent()).unwrap();
        assert!((model.theta()[0] - 0.5).abs() < 0.15, "theta {}", model.theta()[0]);
    }

    #[test]
    fn test_deterministic_forecast() {
        let s = Signal::new("decay", (0..12).map(|i| 1024.0 * 0.5f64.powi(i)).collect());
        let model = ArmaModel::fit(&s, 1, 0, &silent()).unwrap();
        assert_relative_eq!(model.phi()[0], 0.5, epsilon = 1e-8);
        let last = s.values()[11];
        let f = model.forecast(&s, 2, None).unwrap();
        assert_eq!(f.start, 12);
        assert_relative_eq!(f.prediction.values()[0], last * 0.5, epsilon = 1e-6);
        assert_relative_eq!(f.prediction.values()[1], last * 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_band_widens_with_horizon() {
        let s = simulate(500, 0.6, 0.0, 3);
        let model = ArmaModel::fit(&s, 1, 0, &silent()).unwrap();
        let f = model.forecast(&s, 5, Some(95.0)).unwrap();
        let upper = f.upper.unwrap();
        let widths: Vec<f64> = upper.values().iter().zip(f.prediction.values()).map(|(u, p)| u - p).collect();
        assert!(widths.windows(2).all(|w| w[1] >= w[0]));
        assert!(model.forecast(&s, 5, Some(100.0)).is_err());
        assert!(model.forecast(&s, 0, None).is_err());
    }

    #[test]
    fn test_psi_weights_ar1() {
        let s = simulate(300, 0.5, 0.0, 5);
        let model = ArmaModel::fit(&s, 1, 0, &silent()).unwrap();
        let phi = model.phi()[0];
        let psi = model.psi_weights(4);
        for (j, w) in psi.iter().enumerate() {
            assert_relative_eq!(*w, phi.powi(j as i32), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_missing_observations_skipped() {
        let mut s = simulate(400, 0.5, 0.0, 9);
        s.set(100, MISSING).unwrap();
        let model = ArmaModel::fit(&s, 1, 0, &silent()).unwrap();
        assert_eq!(model.skipped(), 2);
        let r = model.residuals(&s);
        assert!(is_missing(r.values()[100]));
        assert!(is_missing(r.values()[101]));
        assert!(!is_missing(r.values()[102]));
    }

    #[test]
    fn test_order_validation() {
        let s = simulate(50, 0.5, 0.0, 1);
        assert!(ArmaModel::fit(&s, 0, 0, &silent()).is_err());
        assert!(ArmaModel::fit(&Signal::new("short", vec![1.0, 2.0, 3.0]), 2, 0, &silent()).is_err());
    }

    #[test]
    fn test_fit_reports_and_honours_cancel() {
        let mut s = simulate(300, 0.5, 0.0, 4);
        s.set(50, MISSING).unwrap();
        let (tx, rx) = unbounded();
        let sink = ChannelSink::new(tx);
        ArmaModel::fit(&s, 1, 0, &TrainingContext::silent().with_sink(&sink)).unwrap();
        let messages: Vec<String> = rx.try_iter().collect();
        assert!(messages[0].contains("skipped 2"));
        assert!(messages.last().unwrap().starts_with("phi"));

        let token = CancelToken::new();
        token.cancel();
        let err = ArmaModel::fit(&s, 1, 1, &TrainingContext::silent().with_cancel(&token));
        assert!(matches!(err, Err(NeuralError::Validation(_))));
    }
}
