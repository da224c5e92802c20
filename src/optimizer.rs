use crate::config::{DEFAULT_NUM_PORTFOLIOS, SAMPLE_CHUNK_SIZE, TRADING_DAYS};
use crate::error::{MarkowitzError, NumericWarning, Result};
use crate::matrix::ReturnMatrix;
use crate::returns::is_positive_definite;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Distribution, Uniform};
use rayon::prelude::*;
use tracing::{debug, info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct OptimizerConfig {
    /// Number of random portfolios to sample.
    pub num_portfolios: usize,
    /// Annualization factor (252 for daily bars, 52 for weekly, ...).
    pub periods_per_year: f64,
    /// Master seed. `None` draws one from entropy and reports it back.
    pub seed: Option<u64>,
    /// Keep the full sample population in the result (charts / CSV).
    pub retain_samples: bool,
    pub chunk_size: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            num_portfolios: DEFAULT_NUM_PORTFOLIOS,
            periods_per_year: TRADING_DAYS,
            seed: None,
            retain_samples: false,
            chunk_size: SAMPLE_CHUNK_SIZE,
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// One random long-only portfolio and its annualized metrics.
#[derive(Clone, Debug, PartialEq)]
pub struct PortfolioSample {
    pub weights: Vec<f64>,
    pub annualized_return: f64,
    pub annualized_volatility: f64,
    /// Return over volatility, no risk-free rate.
    pub sharpe: f64,
}

#[derive(Clone, Debug)]
pub struct OptimizationResult {
    pub min_volatility_portfolio: PortfolioSample,
    pub max_sharpe_portfolio: PortfolioSample,
    pub instrument_order: Vec<String>,
    pub sample_count: usize,
    /// Master seed, when the run was seeded through [`MonteCarloOptimizer::run`].
    pub seed: Option<u64>,
    pub warnings: Vec<NumericWarning>,
    /// Full population, only when `retain_samples` was set.
    pub samples: Option<Vec<PortfolioSample>>,
}

// ──────────────────────────────────────────────────────────────────────────────
// Portfolio Metrics
// ──────────────────────────────────────────────────────────────────────────────

fn portfolio_return(weights: &[f64], means: &[f64]) -> f64 {
    weights.iter().zip(means.iter()).map(|(w, r)| w * r).sum()
}

fn portfolio_variance(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    let n = weights.len();
    let mut var = 0.0;
    for i in 0..n {
        for j in 0..n {
            var += weights[i] * weights[j] * cov[i][j];
        }
    }
    var
}

/// Zero volatility yields a signed infinity, or 0.0 for a zero return.
fn sharpe_ratio(annualized_return: f64, annualized_volatility: f64) -> f64 {
    if annualized_volatility > 0.0 {
        annualized_return / annualized_volatility
    } else if annualized_return > 0.0 {
        f64::INFINITY
    } else if annualized_return < 0.0 {
        f64::NEG_INFINITY
    } else {
        0.0
    }
}

fn evaluate(weights: Vec<f64>, means: &[f64], cov: &[Vec<f64>], periods_per_year: f64) -> PortfolioSample {
    let annualized_return = portfolio_return(&weights, means) * periods_per_year;
    // rounding can push a near-singular quadratic form slightly below zero
    let annualized_volatility =
        portfolio_variance(&weights, cov).max(0.0).sqrt() * periods_per_year.sqrt();
    PortfolioSample {
        weights,
        annualized_return,
        annualized_volatility,
        sharpe: sharpe_ratio(annualized_return, annualized_volatility),
    }
}

/// Draws `n` uniforms in [0, 1) and normalizes them to sum to 1.0.
pub fn sample_weights<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<f64> {
    let uniform = Uniform::new(0.0, 1.0);
    loop {
        let raw: Vec<f64> = (0..n).map(|_| uniform.sample(rng)).collect();
        let sum: f64 = raw.iter().sum();
        if sum > 0.0 {
            return raw.iter().map(|v| v / sum).collect();
        }
    }
}

/// First-encountered index of the max Sharpe and of the min volatility.
fn select_extremes(samples: &[PortfolioSample]) -> (usize, usize) {
    let mut min_vol = 0;
    let mut max_sharpe = 0;
    for (i, s) in samples.iter().enumerate().skip(1) {
        if s.annualized_volatility < samples[min_vol].annualized_volatility {
            min_vol = i;
        }
        if s.sharpe > samples[max_sharpe].sharpe {
            max_sharpe = i;
        }
    }
    (min_vol, max_sharpe)
}

// ──────────────────────────────────────────────────────────────────────────────
// Optimizer: Monte Carlo Sampling
// ──────────────────────────────────────────────────────────────────────────────

pub struct MonteCarloOptimizer {
    config: OptimizerConfig,
}

impl MonteCarloOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Seeds a `StdRng` from the configured seed (or entropy) and runs.
    pub fn run(&self, returns: &ReturnMatrix) -> Result<OptimizationResult> {
        let seed = self
            .config
            .seed
            .unwrap_or_else(|| rand::thread_rng().next_u64());
        info!("Monte Carlo seed: {}", seed);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut result = self.run_with_rng(returns, &mut rng)?;
        result.seed = Some(seed);
        Ok(result)
    }

    /// Runs the sweep with chunk seeds drawn from `rng`.
    ///
    /// Samples are produced in fixed-size chunks on the rayon pool, each chunk
    /// with its own `StdRng`. Chunks are collected in order, so the outcome
    /// depends only on `rng`, never on scheduling.
    pub fn run_with_rng<R: RngCore + ?Sized>(
        &self,
        returns: &ReturnMatrix,
        rng: &mut R,
    ) -> Result<OptimizationResult> {
        let cfg = &self.config;
        let n = returns.instruments().len();
        if n == 0 {
            return Err(MarkowitzError::invalid_input("no instruments to optimize"));
        }
        if returns.len() < 2 {
            return Err(MarkowitzError::invalid_input(format!(
                "need at least 2 return rows to estimate covariance, got {}",
                returns.len()
            )));
        }
        if cfg.num_portfolios == 0 {
            return Err(MarkowitzError::invalid_input("num_portfolios must be > 0"));
        }
        if !(cfg.periods_per_year.is_finite() && cfg.periods_per_year > 0.0) {
            return Err(MarkowitzError::invalid_input(format!(
                "periods_per_year must be positive, got {}",
                cfg.periods_per_year
            )));
        }
        if cfg.chunk_size == 0 {
            return Err(MarkowitzError::invalid_input("chunk_size must be > 0"));
        }

        let means = returns.means();
        let cov = returns.covariance();
        if cov.len() != n || means.len() != n {
            return Err(MarkowitzError::length_mismatch(n, cov.len()));
        }

        info!(
            "Optimizing portfolio with {} assets over {} periods, {} random samples...",
            n,
            returns.len(),
            cfg.num_portfolios
        );
        for (i, name) in returns.instruments().iter().enumerate() {
            info!(
                "  {}: E[r]={:.4}, σ={:.4}",
                name,
                means[i] * cfg.periods_per_year,
                cov[i][i].max(0.0).sqrt() * cfg.periods_per_year.sqrt()
            );
        }

        let mut warnings = Vec::new();
        if !is_positive_definite(&cov) {
            warn!("Covariance matrix is singular or not positive definite; continuing");
            warnings.push(NumericWarning::SingularCovariance);
        }

        let n_chunks = cfg.num_portfolios.div_ceil(cfg.chunk_size);
        let chunk_seeds: Vec<u64> = (0..n_chunks).map(|_| rng.next_u64()).collect();

        let samples: Vec<PortfolioSample> = chunk_seeds
            .into_par_iter()
            .enumerate()
            .map(|(chunk_idx, seed)| {
                let start = chunk_idx * cfg.chunk_size;
                let end = (start + cfg.chunk_size).min(cfg.num_portfolios);
                let mut chunk_rng = StdRng::seed_from_u64(seed);
                (start..end)
                    .map(|_| {
                        let weights = sample_weights(n, &mut chunk_rng);
                        evaluate(weights, &means, &cov, cfg.periods_per_year)
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<Vec<_>>>()
            .into_iter()
            .flatten()
            .collect();
        debug!("Generated {} samples in {} chunks", samples.len(), n_chunks);

        let zero_vol = samples
            .iter()
            .filter(|s| s.annualized_volatility == 0.0)
            .count();
        if zero_vol > 0 {
            warn!(
                "{} sampled portfolio(s) had zero volatility; Sharpe set to a signed infinity",
                zero_vol
            );
            warnings.push(NumericWarning::ZeroVolatility { samples: zero_vol });
        }

        let (min_idx, max_idx) = select_extremes(&samples);
        let min_volatility_portfolio = samples[min_idx].clone();
        let max_sharpe_portfolio = samples[max_idx].clone();

        info!(
            "Max Sharpe: {:.4} (ret {:.4}, vol {:.4}); Min vol: {:.4} (ret {:.4})",
            max_sharpe_portfolio.sharpe,
            max_sharpe_portfolio.annualized_return,
            max_sharpe_portfolio.annualized_volatility,
            min_volatility_portfolio.annualized_volatility,
            min_volatility_portfolio.annualized_return
        );

        let sample_count = samples.len();
        Ok(OptimizationResult {
            min_volatility_portfolio,
            max_sharpe_portfolio,
            instrument_order: returns.instruments().to_vec(),
            sample_count,
            seed: None,
            warnings,
            samples: cfg.retain_samples.then_some(samples),
        })
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
