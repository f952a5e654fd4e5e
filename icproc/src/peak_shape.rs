//! Parametric peak-shape models and the gradient-descent machinery used to
//! fit them to a baseline-subtracted trace segment.

use std::f64::consts::{PI, SQRT_2};

use libm::erf;
use serde::{Deserialize, Serialize};

/// Settings for one gradient-descent model fit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    max_iter: usize,
    learning_rate: f64,
    convergence: f64,
}

impl FitConfig {
    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn convergence(mut self, convergence: f64) -> Self {
        self.convergence = convergence;
        self
    }
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iter: 20_000,
            learning_rate: 1e-3,
            convergence: 1e-9,
        }
    }
}

/// The outcome of one model fit
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelFitResult {
    pub loss: f64,
    pub iterations: usize,
    pub converged: bool,
    /// False when the optimization produced a non-finite loss
    pub success: bool,
}

/// A differentiable peak-shape model fit by steepest descent.
///
/// Implementations provide the density and its parameter gradient; the
/// descent loop, scoring, and area calculations are shared.
pub trait PeakShapeModel: Clone {
    fn density(&self, x: f64) -> f64;

    /// The loss gradient with respect to each model parameter, packed into
    /// another instance of the model
    fn gradient(&self, time: &[f64], signal: &[f64]) -> Self;

    fn gradient_update(&mut self, gradient: Self, learning_rate: f64);

    fn predict(&self, times: &[f64]) -> Vec<f64> {
        times.iter().map(|t| self.density(*t)).collect()
    }

    /// Mean squared deviation between the model and the observations
    fn loss(&self, time: &[f64], signal: &[f64]) -> f64 {
        time.iter()
            .zip(signal)
            .map(|(t, y)| (y - self.density(*t)).powi(2))
            .sum::<f64>()
            / time.len().max(1) as f64
    }

    /// How much better the shape explains the data than a straight line,
    /// `1 - SS_shape / SS_linear`, clamped so a degenerate line test cannot
    /// produce a score above 1
    fn score(&self, time: &[f64], signal: &[f64]) -> f64 {
        let linear = linear_residuals(time, signal);
        let shape: f64 = time
            .iter()
            .zip(signal)
            .map(|(t, y)| (y - self.density(*t)).powi(2))
            .sum();
        if linear <= 0.0 {
            return 0.0;
        }
        1.0 - (shape / linear).max(1e-5)
    }

    /// Integrated model area over the observed times (trapezoid rule)
    fn area(&self, time: &[f64]) -> f64 {
        let mut total = 0.0;
        for pair in time.windows(2) {
            let width = pair[1] - pair[0];
            total += 0.5 * width * (self.density(pair[0]) + self.density(pair[1]));
        }
        total
    }

    fn fit(&mut self, time: &[f64], signal: &[f64]) -> ModelFitResult {
        self.fit_with(time, signal, FitConfig::default())
    }

    /// Steepest-descent fit, keeping the best parameters seen so the caller
    /// never gets a state worse than the initial guess
    fn fit_with(&mut self, time: &[f64], signal: &[f64], config: FitConfig) -> ModelFitResult {
        let mut params = self.clone();
        let mut best_params = self.clone();
        let mut best_loss = f64::INFINITY;
        let mut last_loss = f64::INFINITY;
        let mut iterations = 0;
        let mut converged = false;
        let mut success = true;

        for it in 0..config.max_iter {
            iterations = it;
            let loss = params.loss(time, signal);
            if loss.is_nan() || loss.is_infinite() {
                success = false;
                break;
            }
            if loss < best_loss {
                best_loss = loss;
                best_params = params.clone();
            }
            if (last_loss - loss).abs() < config.convergence {
                converged = true;
                break;
            }
            last_loss = loss;

            let gradient = params.gradient(time, signal);
            params.gradient_update(gradient, config.learning_rate);
        }

        *self = best_params;
        ModelFitResult {
            loss: best_loss,
            iterations,
            converged,
            success,
        }
    }
}

fn linear_residuals(time: &[f64], signal: &[f64]) -> f64 {
    let n = time.len() as f64;
    let xmean = time.iter().sum::<f64>() / n;
    let ymean = signal.iter().sum::<f64>() / n;

    let mut tss = 0.0;
    let mut hat = 0.0;
    for (x, y) in time.iter().zip(signal) {
        let dx = x - xmean;
        tss += dx * dx;
        hat += dx * (y - ymean);
    }
    if tss == 0.0 {
        return signal.iter().map(|y| (y - ymean).powi(2)).sum();
    }
    let beta = hat / tss;
    let alpha = ymean - beta * xmean;
    time.iter()
        .zip(signal)
        .map(|(x, y)| (y - (x * beta + alpha)).powi(2))
        .sum()
}

/// Normalize a gradient in place when its mean magnitude exceeds one, so a
/// single steep parameter cannot blow the step size up
fn clip_gradient(g: &mut [f64]) {
    let norm = g.iter().map(|v| v.abs()).sum::<f64>() / g.len() as f64;
    if norm > 1.0 {
        for v in g.iter_mut() {
            *v /= norm;
        }
    }
}

/// A symmetric Gaussian peak
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianPeakShape {
    pub mu: f64,
    pub sigma: f64,
    pub amplitude: f64,
}

impl GaussianPeakShape {
    pub fn new(mu: f64, sigma: f64, amplitude: f64) -> Self {
        Self {
            mu,
            sigma,
            amplitude,
        }
    }

    pub fn density(&self, x: f64) -> f64 {
        self.amplitude * (-0.5 * (x - self.mu).powi(2) / self.sigma.powi(2)).exp()
    }

    pub fn fwhm(&self) -> f64 {
        2.0 * (2.0 * std::f64::consts::LN_2).sqrt() * self.sigma.abs()
    }
}

impl PeakShapeModel for GaussianPeakShape {
    fn density(&self, x: f64) -> f64 {
        self.density(x)
    }

    fn gradient(&self, time: &[f64], signal: &[f64]) -> Self {
        let n = time.len().max(1) as f64;
        let mut g = [0.0f64; 3];
        for (x, y) in time.iter().zip(signal) {
            let f = self.density(*x);
            let resid = y - f;
            let dx = x - self.mu;
            // d f / d mu, sigma, amplitude
            let dmu = f * dx / self.sigma.powi(2);
            let dsigma = f * dx.powi(2) / self.sigma.powi(3);
            let damp = f / self.amplitude.max(f64::EPSILON);
            g[0] += -2.0 * resid * dmu;
            g[1] += -2.0 * resid * dsigma;
            g[2] += -2.0 * resid * damp;
        }
        for v in g.iter_mut() {
            *v /= n;
        }
        clip_gradient(&mut g);
        Self::new(g[0], g[1], g[2])
    }

    fn gradient_update(&mut self, gradient: Self, learning_rate: f64) {
        self.mu -= gradient.mu * learning_rate;
        self.sigma -= gradient.sigma * learning_rate;
        self.amplitude -= gradient.amplitude * learning_rate;
    }
}

/// A skew-normal style peak: a Gaussian envelope modulated by an error
/// function, capturing the tailing typical of chromatographic peaks
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkewedGaussianPeakShape {
    pub mu: f64,
    pub sigma: f64,
    pub amplitude: f64,
    pub lambda: f64,
}

impl SkewedGaussianPeakShape {
    pub fn new(mu: f64, sigma: f64, amplitude: f64, lambda: f64) -> Self {
        Self {
            mu,
            sigma,
            amplitude,
            lambda,
        }
    }

    pub fn density(&self, x: f64) -> f64 {
        let k = SQRT_2 * self.lambda * (x - self.mu) / (2.0 * self.sigma);
        self.amplitude
            * (erf(k) + 1.0)
            * (-0.5 * (x - self.mu).powi(2) / self.sigma.powi(2)).exp()
    }

    pub fn fwhm(&self) -> f64 {
        2.0 * (2.0 * std::f64::consts::LN_2).sqrt() * self.sigma.abs()
    }
}

impl PeakShapeModel for SkewedGaussianPeakShape {
    fn density(&self, x: f64) -> f64 {
        self.density(x)
    }

    fn gradient(&self, time: &[f64], signal: &[f64]) -> Self {
        let n = time.len().max(1) as f64;
        let two_over_sqrt_pi = 2.0 / PI.sqrt();
        let mut g = [0.0f64; 4];
        for (x, y) in time.iter().zip(signal) {
            let dx = x - self.mu;
            let k = SQRT_2 * self.lambda * dx / (2.0 * self.sigma);
            let envelope = (-0.5 * dx.powi(2) / self.sigma.powi(2)).exp();
            let skew = erf(k) + 1.0;
            let f = self.amplitude * skew * envelope;
            let resid = y - f;
            let erf_slope = two_over_sqrt_pi * (-k * k).exp();

            let dmu = self.amplitude
                * envelope
                * (skew * dx / self.sigma.powi(2)
                    - erf_slope * SQRT_2 * self.lambda / (2.0 * self.sigma));
            let dsigma = self.amplitude
                * envelope
                * (skew * dx.powi(2) / self.sigma.powi(3) - erf_slope * k / self.sigma);
            let damp = skew * envelope;
            let dlambda =
                self.amplitude * envelope * erf_slope * SQRT_2 * dx / (2.0 * self.sigma);

            g[0] += -2.0 * resid * dmu;
            g[1] += -2.0 * resid * dsigma;
            g[2] += -2.0 * resid * damp;
            g[3] += -2.0 * resid * dlambda;
        }
        for v in g.iter_mut() {
            *v /= n;
        }
        clip_gradient(&mut g);
        Self::new(g[0], g[1], g[2], g[3])
    }

    fn gradient_update(&mut self, gradient: Self, learning_rate: f64) {
        self.mu -= gradient.mu * learning_rate;
        self.sigma -= gradient.sigma * learning_rate;
        self.amplitude -= gradient.amplitude * learning_rate;
        if self.amplitude < 0.0 {
            self.amplitude = 0.0;
        }
        self.lambda -= gradient.lambda * learning_rate;
    }
}

/// The shape ultimately reported for one fitted peak
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PeakShape {
    Gaussian(GaussianPeakShape),
    SkewedGaussian(SkewedGaussianPeakShape),
}

impl PeakShape {
    pub fn density(&self, x: f64) -> f64 {
        match self {
            PeakShape::Gaussian(p) => p.density(x),
            PeakShape::SkewedGaussian(p) => p.density(x),
        }
    }

    pub fn location(&self) -> f64 {
        match self {
            PeakShape::Gaussian(p) => p.mu,
            PeakShape::SkewedGaussian(p) => p.mu,
        }
    }

    pub fn amplitude(&self) -> f64 {
        match self {
            PeakShape::Gaussian(p) => p.amplitude,
            PeakShape::SkewedGaussian(p) => p.amplitude,
        }
    }

    pub fn fwhm(&self) -> f64 {
        match self {
            PeakShape::Gaussian(p) => p.fwhm(),
            PeakShape::SkewedGaussian(p) => p.fwhm(),
        }
    }

    pub fn skew(&self) -> f64 {
        match self {
            PeakShape::Gaussian(_) => 0.0,
            PeakShape::SkewedGaussian(p) => p.lambda,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn grid(n: usize, dt: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 * dt).collect()
    }

    #[test]
    fn test_gaussian_fit_refines_initial_guess() {
        let time = grid(120, 0.1);
        let reference = GaussianPeakShape::new(6.0, 0.8, 5.0);
        let signal: Vec<f64> = time.iter().map(|t| reference.density(*t)).collect();

        let mut model = GaussianPeakShape::new(5.6, 1.2, 4.0);
        let start_loss = model.loss(&time, &signal);
        let result = model.fit(&time, &signal);

        assert!(result.success);
        assert!(result.loss <= start_loss);
        assert!((model.mu - reference.mu).abs() < 0.3, "mu = {}", model.mu);
        assert!(
            (model.amplitude - reference.amplitude).abs() / reference.amplitude < 0.25,
            "amplitude = {}",
            model.amplitude
        );
        assert!(model.score(&time, &signal) > 0.5);
    }

    #[test]
    fn test_skewed_fit_refines_initial_guess() {
        let time = grid(150, 0.1);
        let reference = SkewedGaussianPeakShape::new(6.0, 1.0, 3.0, 1.5);
        let signal: Vec<f64> = time.iter().map(|t| reference.density(*t)).collect();

        let mut model = SkewedGaussianPeakShape::new(6.4, 1.3, 2.5, 0.5);
        let start_loss = model.loss(&time, &signal);
        let result = model.fit(&time, &signal);

        assert!(result.success);
        assert!(result.loss <= start_loss);
        assert!(model.score(&time, &signal) > 0.5);
    }

    #[test]
    fn test_gaussian_area_matches_closed_form() {
        let time = grid(400, 0.05);
        let shape = GaussianPeakShape::new(10.0, 0.5, 2.0);
        let expected = shape.amplitude * shape.sigma * (2.0 * PI).sqrt();
        let area = PeakShapeModel::area(&shape, &time);
        assert!(
            (area - expected).abs() / expected < 0.01,
            "area {area} vs {expected}"
        );
    }

    #[test]
    fn test_unstable_fit_flags_failure() {
        let time = grid(50, 0.1);
        let signal = vec![1.0f64; 50];
        // Zero sigma makes the density blow up immediately
        let mut model = GaussianPeakShape::new(2.5, 0.0, 1.0);
        let result = model.fit(&time, &signal);
        assert!(!result.success);
    }

    #[test]
    fn test_score_penalizes_linear_data() {
        let time = grid(100, 0.1);
        let signal: Vec<f64> = time.iter().map(|t| 2.0 * t + 1.0).collect();
        let shape = GaussianPeakShape::new(5.0, 1.0, 3.0);
        assert!(shape.score(&time, &signal) < 0.5);
    }
}
