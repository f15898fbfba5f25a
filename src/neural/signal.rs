// projeto: npredict
// file: src/neural/signal.rs
// Named time series, modification operators and plain-text export/import

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::neural::utils::{least_squares, NeuralError};

/// Marker for an absent observation.
pub const MISSING: f64 = -1.0e60;

/// Decimal places used by the text export.
pub const TEXT_PRECISION: usize = 7;

/// Line written in place of a missing value.
pub const MISSING_PLACEHOLDER: &str = ",";

#[inline]
pub fn is_missing(value: f64) -> bool {
    value == MISSING
}

/// A modification applied to a signal, kept so predictions made on the
/// modified series can be mapped back to the original scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppliedTransform {
    Center { mean: f64 },
    Detrend { intercept: f64, slope: f64 },
    Scale { factor: f64 },
    Standardize { mean: f64, std: f64 },
    Difference { lag: usize, tail: Vec<f64>, len_after: usize },
    Log,
    Exp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    name: String,
    values: Vec<f64>,
    transforms: Vec<AppliedTransform>,
}

impl Signal {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Signal {
            name: name.into(),
            values,
            transforms: Vec::new(),
        }
    }

    pub fn filled(name: impl Into<String>, len: usize, value: f64) -> Self {
        Signal::new(name, vec![value; len])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    pub fn set(&mut self, index: usize, value: f64) -> Result<(), NeuralError> {
        let len = self.values.len();
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(NeuralError::Validation(format!(
                "index {} out of range for signal '{}' of length {}",
                index, self.name, len
            ))),
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn transforms(&self) -> &[AppliedTransform] {
        &self.transforms
    }

    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| is_missing(**v)).count()
    }

    /// Non-missing values with their indices.
    pub fn valid(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.values.iter().copied().enumerate().filter(|(_, v)| !is_missing(*v))
    }

    pub fn mean(&self) -> Option<f64> {
        let (sum, n) = self.valid().fold((0.0, 0usize), |(s, n), (_, v)| (s + v, n + 1));
        if n == 0 { None } else { Some(sum / n as f64) }
    }

    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let (ss, n) = self.valid().fold((0.0, 0usize), |(s, n), (_, v)| (s + (v - mean).powi(2), n + 1));
        if n < 2 { None } else { Some((ss / (n - 1) as f64).sqrt()) }
    }

    fn map_valid(&mut self, f: impl Fn(f64) -> f64) {
        for v in self.values.iter_mut() {
            if !is_missing(*v) {
                *v = f(*v);
            }
        }
    }

    fn require_mean(&self, op: &str) -> Result<f64, NeuralError> {
        self.mean().ok_or_else(|| NeuralError::Validation(format!(
            "cannot {} signal '{}': no valid values", op, self.name
        )))
    }

    /// Subtract the mean of the valid values.
    pub fn center(&mut self) -> Result<f64, NeuralError> {
        let mean = self.require_mean("center")?;
        self.map_valid(|v| v - mean);
        self.transforms.push(AppliedTransform::Center { mean });
        debug!("Centered '{}' (mean {:.6})", self.name, mean);
        Ok(mean)
    }

    /// Remove the least-squares line through the valid values.
    pub fn detrend(&mut self) -> Result<(f64, f64), NeuralError> {
        let points: Vec<(usize, f64)> = self.valid().collect();
        if points.len() < 2 {
            return Err(NeuralError::Validation(format!(
                "cannot detrend signal '{}': need at least 2 valid values", self.name
            )));
        }
        let design: Vec<f64> = points.iter().flat_map(|(i, _)| [1.0, *i as f64]).collect();
        let rhs: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
        let coef = least_squares(points.len(), 2, &design, &rhs)?;
        let (intercept, slope) = (coef[0], coef[1]);

        for (i, v) in self.values.iter_mut().enumerate() {
            if !is_missing(*v) {
                *v -= intercept + slope * i as f64;
            }
        }
        self.transforms.push(AppliedTransform::Detrend { intercept, slope });
        debug!("Detrended '{}' (intercept {:.6}, slope {:.6})", self.name, intercept, slope);
        Ok((intercept, slope))
    }

    pub fn scale(&mut self, factor: f64) -> Result<(), NeuralError> {
        if !factor.is_finite() || factor == 0.0 {
            return Err(NeuralError::Validation(format!(
                "scale factor must be finite and nonzero, got {}", factor
            )));
        }
        self.map_valid(|v| v * factor);
        self.transforms.push(AppliedTransform::Scale { factor });
        Ok(())
    }

    /// Subtract the mean and divide by the standard deviation.
    pub fn standardize(&mut self) -> Result<(f64, f64), NeuralError> {
        let mean = self.require_mean("standardize")?;
        let std = self.std_dev().unwrap_or(0.0);
        if std <= 1e-12 {
            return Err(NeuralError::Validation(format!(
                "cannot standardize signal '{}': zero variance", self.name
            )));
        }
        self.map_valid(|v| (v - mean) / std);
        self.transforms.push(AppliedTransform::Standardize { mean, std });
        Ok((mean, std))
    }

    /// Replace the series by `x[t] - x[t - lag]`; the result is `lag` shorter.
    pub fn difference(&mut self, lag: usize) -> Result<(), NeuralError> {
        if lag == 0 || lag >= self.values.len() {
            return Err(NeuralError::Validation(format!(
                "difference lag {} invalid for signal '{}' of length {}",
                lag, self.name, self.values.len()
            )));
        }
        let tail = self.values[self.values.len() - lag..].to_vec();
        let diffs: Vec<f64> = (lag..self.values.len())
            .map(|t| {
                let (a, b) = (self.values[t], self.values[t - lag]);
                if is_missing(a) || is_missing(b) { MISSING } else { a - b }
            })
            .collect();
        let len_after = diffs.len();
        self.values = diffs;
        self.transforms.push(AppliedTransform::Difference { lag, tail, len_after });
        Ok(())
    }

    /// Inverse of `difference`: prepend `seeds` and accumulate with the given
    /// lag. If the most recent modification was a difference with the same
    /// lag it is dropped from the history. Integrating on top of any other
    /// recorded modification is rejected, since it could not be undone.
    pub fn integrate(&mut self, lag: usize, seeds: &[f64]) -> Result<(), NeuralError> {
        if lag == 0 || seeds.len() != lag {
            return Err(NeuralError::Validation(format!(
                "integrate needs {} seed values for lag {}, got {}",
                lag, lag, seeds.len()
            )));
        }
        let undoes_difference =
            matches!(self.transforms.last(), Some(AppliedTransform::Difference { lag: l, .. }) if *l == lag);
        if !undoes_difference && !self.transforms.is_empty() {
            return Err(NeuralError::Validation(format!(
                "signal '{}' can only be integrated with lag {} directly after a matching difference",
                self.name, lag
            )));
        }
        let mut levels = seeds.to_vec();
        levels.reserve(self.values.len());
        for (j, &d) in self.values.iter().enumerate() {
            let prev = levels[j];
            levels.push(if is_missing(d) || is_missing(prev) { MISSING } else { prev + d });
        }
        self.values = levels;
        if undoes_difference {
            self.transforms.pop();
        }
        Ok(())
    }

    pub fn log_transform(&mut self) -> Result<(), NeuralError> {
        if let Some((i, v)) = self.valid().find(|(_, v)| *v <= 0.0) {
            return Err(NeuralError::Validation(format!(
                "cannot log signal '{}': value {} at index {} is not positive", self.name, v, i
            )));
        }
        self.map_valid(f64::ln);
        self.transforms.push(AppliedTransform::Log);
        Ok(())
    }

    pub fn exp_transform(&mut self) -> Result<(), NeuralError> {
        self.map_valid(f64::exp);
        self.transforms.push(AppliedTransform::Exp);
        Ok(())
    }

    /// Map `target`, expressed in this signal's modified coordinates and
    /// starting at index `offset`, back through every recorded modification.
    ///
    /// A difference can only be undone when `target` continues the series
    /// directly after its end.
    pub fn undo_onto(&self, target: &mut Signal, offset: usize) -> Result<(), NeuralError> {
        let mut start = offset;
        for transform in self.transforms.iter().rev() {
            match transform {
                AppliedTransform::Center { mean } => target.map_valid(|v| v + mean),
                AppliedTransform::Scale { factor } => target.map_valid(|v| v / factor),
                AppliedTransform::Standardize { mean, std } => target.map_valid(|v| v * std + mean),
                AppliedTransform::Detrend { intercept, slope } => {
                    for (i, v) in target.values.iter_mut().enumerate() {
                        if !is_missing(*v) {
                            *v += intercept + slope * (start + i) as f64;
                        }
                    }
                }
                AppliedTransform::Log => target.map_valid(f64::exp),
                AppliedTransform::Exp => {
                    for v in target.values.iter_mut() {
                        if !is_missing(*v) {
                            *v = if *v > 0.0 { v.ln() } else { MISSING };
                        }
                    }
                }
                AppliedTransform::Difference { lag, tail, len_after } => {
                    if start != *len_after {
                        return Err(NeuralError::Validation(format!(
                            "differenced signal '{}' can only be undone from index {}, got {}",
                            self.name, len_after, start
                        )));
                    }
                    let mut levels = tail.clone();
                    for (j, &d) in target.values.iter().enumerate() {
                        let prev = levels[j];
                        levels.push(if is_missing(d) || is_missing(prev) { MISSING } else { prev + d });
                    }
                    target.values = levels.split_off(*lag);
                    start += lag;
                }
            }
        }
        Ok(())
    }

    pub fn write_text<W: Write>(&self, writer: &mut W) -> Result<(), NeuralError> {
        for &v in &self.values {
            if is_missing(v) {
                writeln!(writer, "{}", MISSING_PLACEHOLDER)?;
            } else {
                writeln!(writer, "{:.*}", TEXT_PRECISION, v)?;
            }
        }
        Ok(())
    }

    pub fn save_text(&self, path: impl AsRef<Path>) -> Result<(), NeuralError> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_text(&mut writer)?;
        writer.flush()?;
        info!("💾 Signal '{}' ({} values) written to {}", self.name, self.len(), path.display());
        Ok(())
    }

    /// Parse one value per line; a line holding only a comma is a missing
    /// value and blank lines are ignored.
    pub fn read_text<R: BufRead>(name: impl Into<String>, reader: R) -> Result<Signal, NeuralError> {
        let mut values = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let token = line.trim();
            if token.is_empty() {
                continue;
            }
            if token == MISSING_PLACEHOLDER {
                values.push(MISSING);
                continue;
            }
            let value = token.parse::<f64>().map_err(|e| NeuralError::Validation(format!(
                "line {}: cannot parse '{}' as a number: {}", lineno + 1, token, e
            )))?;
            if !value.is_finite() {
                return Err(NeuralError::Validation(format!(
                    "line {}: '{}' is not a finite number", lineno + 1, token
                )));
            }
            values.push(value);
        }
        Ok(Signal::new(name, values))
    }

    pub fn load_text(path: impl AsRef<Path>) -> Result<Signal, NeuralError> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "signal".to_string());
        let signal = Signal::read_text(name, BufReader::new(File::open(path)?))?;
        info!("📥 Loaded signal '{}' with {} values ({} missing) from {}",
              signal.name, signal.len(), signal.missing_count(), path.display());
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    fn ramp(n: usize) -> Signal {
        Signal::new("ramp", (0..n).map(|i| 3.0 + 0.5 * i as f64 + (i as f64).sin()).collect())
    }

    #[test]
    fn test_text_round_trip_with_missing() {
        let mut signal = Signal::new("s", vec![1.25, -0.0000001, 12345.6789012, 0.0, 3.1415926]);
        signal.set(3, MISSING).unwrap();

        let mut buf = Vec::new();
        signal.write_text(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert_eq!(text.lines().nth(0), Some("1.2500000"));
        assert_eq!(text.lines().nth(3), Some(","));

        let back = Signal::read_text("s", Cursor::new(buf)).unwrap();
        assert_eq!(back.len(), signal.len());
        for (a, b) in signal.values().iter().zip(back.values()) {
            if is_missing(*a) {
                assert!(is_missing(*b));
            } else {
                assert!((a - b).abs() <= 0.5e-7 + 1e-12, "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_read_text_rejects_garbage() {
        let err = Signal::read_text("bad", Cursor::new("1.0\nabc\n")).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.txt");
        let signal = Signal::new("prices", vec![10.5, MISSING, 11.0]);
        signal.save_text(&path).unwrap();
        let back = Signal::load_text(&path).unwrap();
        assert_eq!(back.name(), "prices");
        assert_eq!(back.missing_count(), 1);
    }

    #[test]
    fn test_center_skips_missing() {
        let mut s = Signal::new("c", vec![1.0, MISSING, 3.0]);
        let mean = s.center().unwrap();
        assert_relative_eq!(mean, 2.0);
        assert_eq!(s.values(), &[-1.0, MISSING, 1.0]);
    }

    #[test]
    fn test_detrend_removes_line() {
        let mut s = Signal::new("line", (0..10).map(|i| 4.0 - 0.25 * i as f64).collect());
        let (a, b) = s.detrend().unwrap();
        assert_relative_eq!(a, 4.0, epsilon = 1e-9);
        assert_relative_eq!(b, -0.25, epsilon = 1e-9);
        assert!(s.values().iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_standardize_and_undo() {
        let original = ramp(20);
        let mut s = original.clone();
        s.standardize().unwrap();
        s.scale(2.0).unwrap();
        assert_relative_eq!(s.mean().unwrap(), 0.0, epsilon = 1e-12);

        let mut restored = Signal::new("r", s.values().to_vec());
        s.undo_onto(&mut restored, 0).unwrap();
        for (a, b) in original.values().iter().zip(restored.values()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_difference_integrate_round_trip() {
        let original = ramp(12);
        let mut s = original.clone();
        s.difference(2).unwrap();
        assert_eq!(s.len(), 10);
        s.integrate(2, &original.values()[..2]).unwrap();
        assert!(s.transforms().is_empty());
        for (a, b) in original.values().iter().zip(s.values()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_undo_difference_continues_series() {
        let original = Signal::new("lin", (1..9).map(|i| 2.0 * i as f64).collect());
        let mut s = original.clone();
        s.log_transform().unwrap();
        s.difference(1).unwrap();

        // future differences in log space equal to the last observed one
        let last = *s.values().last().unwrap();
        let mut future = Signal::new("f", vec![last, last]);
        s.undo_onto(&mut future, s.len()).unwrap();
        let growth = 16.0 / 14.0;
        assert_relative_eq!(future.values()[0], 16.0 * growth, epsilon = 1e-9);
        assert_relative_eq!(future.values()[1], 16.0 * growth * growth, epsilon = 1e-9);

        let mut misplaced = Signal::new("f", vec![0.0]);
        assert!(s.undo_onto(&mut misplaced, 0).is_err());
    }

    #[test]
    fn test_log_rejects_non_positive() {
        let mut s = Signal::new("n", vec![1.0, 0.0]);
        assert!(s.log_transform().is_err());
        let mut ok = Signal::new("p", vec![1.0, MISSING, std::f64::consts::E]);
        ok.log_transform().unwrap();
        assert_relative_eq!(ok.values()[2], 1.0);
        assert!(is_missing(ok.values()[1]));
    }

    #[test]
    fn test_exp_undoes_through_log() {
        let mut s = Signal::new("e", vec![0.0, 1.0, MISSING, -2.0]);
        s.exp_transform().unwrap();
        assert_relative_eq!(s.values()[1], std::f64::consts::E);
        let mut back = s.clone();
        s.undo_onto(&mut back, 0).unwrap();
        assert_relative_eq!(back.values()[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(back.values()[3], -2.0, epsilon = 1e-12);
        assert!(is_missing(back.values()[2]));
    }

    #[test]
    fn test_difference_propagates_missing() {
        let mut s = Signal::new("m", vec![1.0, MISSING, 4.0, 8.0]);
        s.difference(1).unwrap();
        assert!(is_missing(s.values()[0]));
        assert!(is_missing(s.values()[1]));
        assert_relative_eq!(s.values()[2], 4.0);
    }

    #[test]
    fn test_read_text_rejects_non_finite() {
        for token in ["NaN", "inf", "-infinity"] {
            let text = format!("1.0\n{}\n", token);
            let err = Signal::read_text("bad", Cursor::new(text)).unwrap_err();
            assert!(matches!(&err, NeuralError::Validation(m) if m.contains("line 2")), "{:?}", err);
        }
    }

    #[test]
    fn test_integrate_needs_matching_difference() {
        let mut raw = Signal::new("d", vec![1.0, 1.0, 1.0]);
        raw.integrate(1, &[5.0]).unwrap();
        assert_eq!(raw.values(), &[5.0, 6.0, 7.0, 8.0]);
        assert!(raw.transforms().is_empty());

        let mut centered = ramp(8);
        centered.center().unwrap();
        let before = centered.clone();
        assert!(matches!(centered.integrate(1, &[0.0]), Err(NeuralError::Validation(_))));
        assert_eq!(centered, before);

        let mut diffed = ramp(8);
        diffed.difference(2).unwrap();
        assert!(diffed.integrate(1, &[0.0]).is_err());
    }
}
