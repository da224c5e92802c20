/// Simple period-over-period returns `(p[i] - p[i-1]) / p[i-1]`. The first
/// price has no return, so `n` prices yield `n - 1` values.
pub fn to_returns(prices: &[f64]) -> Vec<f64> {
    prices.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect()
}

/// `sum(returns * leverage)`, a linear approximation of compounding.
pub fn weighted_cumulative_return(returns: &[f64], leverage: f64) -> f64 {
    returns.iter().map(|r| r * leverage).sum()
}

pub fn mean(series: &[f64]) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    series.iter().sum::<f64>() / series.len() as f64
}

/// Sample covariance (n - 1 denominator) of equally long columns.
pub fn covariance_matrix(columns: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = columns.len();
    let means: Vec<f64> = columns.iter().map(|c| mean(c)).collect();
    let mut cov = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let len = columns[i].len().min(columns[j].len());
            if len < 2 {
                continue;
            }
            let sum: f64 = (0..len)
                .map(|k| (columns[i][k] - means[i]) * (columns[j][k] - means[j]))
                .sum();
            let covariance = sum / (len as f64 - 1.0);
            cov[i][j] = covariance;
            cov[j][i] = covariance;
        }
    }
    cov
}

/// Cholesky probe: true when every pivot stays strictly positive.
pub fn is_positive_definite(matrix: &[Vec<f64>]) -> bool {
    let n = matrix.len();
    let scale = (0..n)
        .map(|i| matrix[i][i].abs())
        .fold(0.0_f64, f64::max);
    if scale == 0.0 {
        return false;
    }
    let tolerance = scale * 1e-12;

    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let diag = matrix[i][i] - sum;
                if diag <= tolerance {
                    return false;
                }
                l[i][j] = diag.sqrt();
            } else {
                l[i][j] = (matrix[i][j] - sum) / l[j][j];
            }
        }
    }
    true
}
