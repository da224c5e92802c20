use crate::config::{LEVERAGE_MAX_ITERATIONS, LEVERAGE_STEP};
use crate::error::{MarkowitzError, Result};
use crate::matrix::{PriceMatrix, ReturnMatrix};
use crate::returns::weighted_cumulative_return;
use crate::table::{PriceTable, RawBar};
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq)]
pub struct LeverageRequest {
    pub target_return: f64,
    pub instruments: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeverageResult {
    pub instrument: String,
    /// Rounded to 2 decimals.
    pub leverage_factor: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationParams {
    pub step: f64,
    pub max_iterations: usize,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            step: LEVERAGE_STEP,
            max_iterations: LEVERAGE_MAX_ITERATIONS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// [`calibrate_with`] using the configured step and iteration cap.
pub fn calibrate(instrument: &str, returns: &[f64], target: f64) -> Result<LeverageResult> {
    calibrate_with(instrument, returns, target, CalibrationParams::default())
}

/// Directional step search for the multiplier that brings the linear
/// cumulative return of `returns` onto `target`, starting at `L = 1.0`.
///
/// Moves `L` by one step towards the target until the cumulative return
/// crosses it (the direction would flip) or hits it exactly. At most
/// `max_iterations` steps are taken; the series is evaluated after the last.
pub fn calibrate_with(
    instrument: &str,
    returns: &[f64],
    target: f64,
    params: CalibrationParams,
) -> Result<LeverageResult> {
    if !target.is_finite() {
        return Err(MarkowitzError::invalid_input(format!(
            "target return for {} must be finite, got {}",
            instrument, target
        )));
    }
    if !(params.step > 0.0) {
        return Err(MarkowitzError::invalid_input("leverage step must be positive"));
    }

    let mut leverage = 1.0_f64;
    let mut direction: Option<Direction> = None;
    let mut iterations = 0usize;

    loop {
        let cumulative = weighted_cumulative_return(returns, leverage);
        if !cumulative.is_finite() {
            return Err(MarkowitzError::invalid_input(format!(
                "{} has a non-finite cumulative return at leverage {:.2}",
                instrument, leverage
            )));
        }

        let wanted = if cumulative < target {
            Direction::Up
        } else if cumulative > target {
            Direction::Down
        } else {
            break;
        };
        // crossed the target: the previous step went the other way
        if direction.is_some_and(|d| d != wanted) {
            break;
        }
        if iterations >= params.max_iterations {
            return Err(MarkowitzError::DegenerateSeries {
                instrument: instrument.to_string(),
                iterations,
                target,
            });
        }

        direction = Some(wanted);
        match wanted {
            Direction::Up => leverage += params.step,
            Direction::Down => leverage -= params.step,
        }
        iterations += 1;
    }

    let leverage_factor = (leverage * 100.0).round() / 100.0;
    debug!(
        "{}: leverage {:.2} after {} steps (target {})",
        instrument, leverage_factor, iterations, target
    );

    Ok(LeverageResult {
        instrument: instrument.to_string(),
        leverage_factor,
    })
}

/// Solves every requested instrument and returns their return columns scaled
/// by the rounded leverage factors, in request order.
pub fn adjust_leverage(
    prices: &PriceMatrix,
    request: &LeverageRequest,
) -> Result<(ReturnMatrix, Vec<LeverageResult>)> {
    if request.instruments.is_empty() {
        return Err(MarkowitzError::invalid_input("leverage request has no instruments"));
    }

    let returns = prices.select(&request.instruments)?.returns()?;

    let results = returns
        .instruments()
        .iter()
        .zip(returns.columns())
        .map(|(name, column)| calibrate(name, column, request.target_return))
        .collect::<Result<Vec<_>>>()?;

    for r in &results {
        info!(
            "Leverage for {}: {:.2}x (target cumulative return {})",
            r.instrument, r.leverage_factor, request.target_return
        );
    }

    let factors: Vec<f64> = results.iter().map(|r| r.leverage_factor).collect();
    Ok((returns.scaled(&factors)?, results))
}

/// Price path implied by compounding one instrument's (levered) returns from
/// a base of 1.0, as a derived table tagged with the instrument.
pub fn levered_price_table(returns: &ReturnMatrix, instrument: &str) -> Result<PriceTable> {
    let column = returns
        .column(instrument)
        .ok_or_else(|| MarkowitzError::invalid_input(format!("unknown instrument {}", instrument)))?;

    let mut level = 1.0;
    let raw = returns
        .dates()
        .iter()
        .zip(column)
        .map(|(date, r)| {
            level *= 1.0 + r;
            RawBar {
                time: date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
                open: Some(level),
                high: Some(level),
                low: Some(level),
                close: Some(level),
                volume: Some(0.0),
                ticker: None,
                timeframe: None,
            }
        })
        .collect();

    PriceTable::derived(raw).with_ticker(instrument).validated()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn series(sum: f64, n: usize) -> Vec<f64> {
        // alternating noise that cancels out, plus a constant drift
        (0..n)
            .map(|i| sum / n as f64 + if i % 2 == 0 { 0.01 } else { -0.01 })
            .collect()
    }

    #[test]
    fn test_calibrate_scales_up_to_target() {
        let returns = series(0.2, 100);
        let result = calibrate("ITSA4", &returns, 1.0).unwrap();
        assert_eq!(result.instrument, "ITSA4");
        assert!((result.leverage_factor - 5.0).abs() <= 0.011, "got {}", result.leverage_factor);
    }

    #[test]
    fn test_calibrate_scales_down_to_target() {
        let returns = series(1.5625, 250);
        let result = calibrate("PETR4", &returns, 1.0).unwrap();
        assert!(
            result.leverage_factor >= 0.63 && result.leverage_factor <= 0.65,
            "got {}",
            result.leverage_factor
        );
    }

    #[test]
    fn test_calibration_round_trip_within_one_step() {
        let returns = series(0.37, 120);
        let raw: f64 = returns.iter().sum();
        for target in [0.1, 0.5, 1.0, 2.0] {
            let result = calibrate("X", &returns, target).unwrap();
            let reached = weighted_cumulative_return(&returns, result.leverage_factor);
            assert!(
                (reached - target).abs() <= LEVERAGE_STEP * raw.abs() + 1e-9,
                "target {} reached {}",
                target,
                reached
            );
        }
    }

    #[test]
    fn test_exact_match_stops_immediately() {
        let returns = vec![0.25, 0.25];
        let result = calibrate("X", &returns, 0.5).unwrap();
        assert_eq!(result.leverage_factor, 1.0);

        // zero-target on a flat series is met exactly at the start
        let flat = vec![0.0; 10];
        assert_eq!(calibrate("FLAT", &flat, 0.0).unwrap().leverage_factor, 1.0);
    }

    #[test]
    fn test_flat_series_hits_iteration_cap() {
        let flat = vec![0.0; 10];
        let params = CalibrationParams {
            step: LEVERAGE_STEP,
            max_iterations: 1_000,
        };
        let err = calibrate_with("FLAT", &flat, 1.0, params).unwrap_err();
        match err {
            MarkowitzError::DegenerateSeries {
                instrument,
                iterations,
                ..
            } => {
                assert_eq!(instrument, "FLAT");
                assert_eq!(iterations, 1_000);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_crossing_on_the_last_allowed_step_succeeds() {
        let params = CalibrationParams {
            step: 0.01,
            max_iterations: 1,
        };
        let result = calibrate_with("X", &[1.0], 1.005, params).unwrap();
        assert_eq!(result.leverage_factor, 1.01);

        // two steps needed, one allowed
        assert!(matches!(
            calibrate_with("X", &[1.0], 1.015, params),
            Err(MarkowitzError::DegenerateSeries { iterations: 1, .. })
        ));
    }

    #[test]
    fn test_levered_price_table_compounds_returns() {
        let dates: Vec<NaiveDate> = (2..=4)
            .map(|d| NaiveDate::from_ymd_opt(2023, 1, d).unwrap())
            .collect();
        let returns = ReturnMatrix::new(dates, vec!["A".into()], vec![vec![0.1, -0.5, 1.0]])
            .unwrap()
            .scaled(&[2.0])
            .unwrap();

        let table = levered_price_table(&returns, "A").unwrap();
        assert_eq!(table.ticker(), Some("A"));
        let closes: Vec<f64> = table.candles().iter().map(|c| c.close).collect();
        assert_eq!(closes.len(), 3);
        assert!((closes[0] - 1.2).abs() < 1e-12);
        assert!(closes[1].abs() < 1e-12);
        assert!(closes[2].abs() < 1e-12);
        assert_eq!(table.candles()[2].date(), NaiveDate::from_ymd_opt(2023, 1, 4).unwrap());

        assert!(levered_price_table(&returns, "B").is_err());
    }

    #[test]
    fn test_non_finite_target_is_rejected() {
        assert!(calibrate("X", &[0.1], f64::NAN).is_err());
    }

    #[test]
    fn test_adjust_leverage_scales_each_column() {
        let dates: Vec<NaiveDate> = (1..=5)
            .map(|d| NaiveDate::from_ymd_opt(2023, 1, d).unwrap())
            .collect();
        let prices = PriceMatrix::new(
            dates,
            vec!["A".into(), "B".into()],
            vec![
                vec![100.0, 101.0, 102.0, 103.0, 104.0],
                vec![50.0, 52.0, 51.0, 55.0, 60.0],
            ],
        )
        .unwrap();
        let request = LeverageRequest {
            target_return: 0.1,
            instruments: vec!["B".into(), "A".into()],
        };

        let (adjusted, results) = adjust_leverage(&prices, &request).unwrap();
        assert_eq!(adjusted.instruments(), &["B".to_string(), "A".to_string()]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].instrument, "B");

        let raw = prices.returns().unwrap();
        for r in &results {
            let unscaled = raw.column(&r.instrument).unwrap();
            let scaled = adjusted.column(&r.instrument).unwrap();
            for (o, s) in unscaled.iter().zip(scaled) {
                assert!((o * r.leverage_factor - s).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_adjust_leverage_rejects_unknown_or_empty() {
        let prices = PriceMatrix::new(
            vec![
                NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2023, 1, 2).unwrap(),
            ],
            vec!["A".into()],
            vec![vec![1.0, 1.1]],
        )
        .unwrap();
        let unknown = LeverageRequest {
            target_return: 0.1,
            instruments: vec!["Z".into()],
        };
        assert!(adjust_leverage(&prices, &unknown).is_err());
        let empty = LeverageRequest {
            target_return: 0.1,
            instruments: vec![],
        };
        assert!(adjust_leverage(&prices, &empty).is_err());
    }
}
