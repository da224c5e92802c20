use crate::error::{MarkowitzError, Result};
use crate::returns::{covariance_matrix, mean, to_returns};
use crate::table::PriceTable;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// Closing prices: ascending unique dates × instruments, no gaps.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceMatrix {
    dates: Vec<NaiveDate>,
    instruments: Vec<String>,
    columns: Vec<Vec<f64>>,
}

/// Simple returns derived from a [`PriceMatrix`]. The first price date has no
/// return, so `dates` starts at the second price date.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnMatrix {
    dates: Vec<NaiveDate>,
    instruments: Vec<String>,
    columns: Vec<Vec<f64>>,
}

fn check_shape(dates: &[NaiveDate], instruments: &[String], columns: &[Vec<f64>]) -> Result<()> {
    if instruments.is_empty() {
        return Err(MarkowitzError::invalid_input("instrument list is empty"));
    }
    let mut seen = HashSet::new();
    for name in instruments {
        if !seen.insert(name.as_str()) {
            return Err(MarkowitzError::invalid_input(format!(
                "instrument {} appears more than once",
                name
            )));
        }
    }
    if columns.len() != instruments.len() {
        return Err(MarkowitzError::length_mismatch(instruments.len(), columns.len()));
    }
    for column in columns {
        if column.len() != dates.len() {
            return Err(MarkowitzError::length_mismatch(dates.len(), column.len()));
        }
    }
    if dates.windows(2).any(|w| w[0] >= w[1]) {
        return Err(MarkowitzError::invalid_input(
            "dates must be unique and in ascending order",
        ));
    }
    Ok(())
}

impl PriceMatrix {
    pub fn new(dates: Vec<NaiveDate>, instruments: Vec<String>, columns: Vec<Vec<f64>>) -> Result<Self> {
        if dates.is_empty() {
            return Err(MarkowitzError::invalid_input("price matrix has no rows"));
        }
        check_shape(&dates, &instruments, &columns)?;
        for (name, column) in instruments.iter().zip(&columns) {
            if let Some(bad) = column.iter().find(|p| !p.is_finite() || **p <= 0.0) {
                return Err(MarkowitzError::invalid_input(format!(
                    "{} has a non-positive or non-finite price ({})",
                    name, bad
                )));
            }
        }
        Ok(Self {
            dates,
            instruments,
            columns,
        })
    }

    /// Inner-joins the close series of several tables on calendar date.
    /// Dates missing from any table are dropped.
    pub fn join(tables: &[PriceTable]) -> Result<Self> {
        if tables.is_empty() {
            return Err(MarkowitzError::invalid_input("no price tables to join"));
        }

        let mut instruments = Vec::with_capacity(tables.len());
        let mut series: Vec<BTreeMap<NaiveDate, f64>> = Vec::with_capacity(tables.len());
        for table in tables {
            let ticker = table
                .ticker()
                .ok_or_else(|| MarkowitzError::invalid_input("price table has no ticker"))?
                .to_string();
            if !table.is_valid() {
                return Err(MarkowitzError::invalid_input(format!(
                    "price table for {} is not a valid OHLCV table",
                    ticker
                )));
            }
            series.push(table.candles().iter().map(|c| (c.date(), c.close)).collect());
            instruments.push(ticker);
        }

        let mut common: BTreeSet<NaiveDate> = series[0].keys().copied().collect();
        for s in &series[1..] {
            common.retain(|d| s.contains_key(d));
        }
        debug!(
            "Joined {} tables: {} common dates out of {:?}",
            tables.len(),
            common.len(),
            series.iter().map(BTreeMap::len).collect::<Vec<_>>()
        );

        let dates: Vec<NaiveDate> = common.into_iter().collect();
        let columns = series
            .iter()
            .map(|s| dates.iter().map(|d| s[d]).collect())
            .collect();
        Self::new(dates, instruments, columns)
    }

    /// Loads a `Date,<inst1>,<inst2>,...` file, keeping `instruments` in the
    /// given order (every column when empty). Headers are matched
    /// case-insensitively and reported upper-cased. A row is dropped when one
    /// of the kept cells is empty or non-numeric; gaps in other columns are
    /// ignored.
    pub fn from_csv(path: impl AsRef<Path>, instruments: &[String]) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        if headers.len() < 2 {
            return Err(MarkowitzError::invalid_input(format!(
                "{} needs a date column and at least one instrument column",
                path.display()
            )));
        }
        let available: Vec<String> = headers
            .iter()
            .skip(1)
            .map(|h| h.trim().to_uppercase())
            .collect();

        let (names, indices): (Vec<String>, Vec<usize>) = if instruments.is_empty() {
            available.iter().cloned().zip(1..).unzip()
        } else {
            instruments
                .iter()
                .map(|name| {
                    let wanted = name.trim().to_uppercase();
                    available
                        .iter()
                        .position(|h| *h == wanted)
                        .map(|idx| (wanted, idx + 1))
                        .ok_or_else(|| {
                            MarkowitzError::invalid_input(format!(
                                "unknown instrument {} in {}",
                                name,
                                path.display()
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .unzip()
        };

        let mut rows: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
        let mut dropped = 0usize;
        for record in reader.records() {
            let record = record?;
            let Some(date) = record.get(0).and_then(parse_date) else {
                dropped += 1;
                continue;
            };
            let values: Option<Vec<f64>> = indices
                .iter()
                .map(|&idx| {
                    record
                        .get(idx)
                        .and_then(|cell| cell.trim().parse::<f64>().ok())
                        .filter(|v| v.is_finite())
                })
                .collect();
            match values {
                Some(v) => {
                    rows.insert(date, v);
                }
                None => dropped += 1,
            }
        }
        info!(
            "Loaded {} rows for {:?} from {} ({} incomplete rows dropped)",
            rows.len(),
            names,
            path.display(),
            dropped
        );

        let dates: Vec<NaiveDate> = rows.keys().copied().collect();
        let columns = (0..names.len())
            .map(|j| rows.values().map(|r| r[j]).collect())
            .collect();
        Self::new(dates, names, columns)
    }

    /// Keeps the given instruments, in the given order.
    pub fn select(&self, instruments: &[String]) -> Result<Self> {
        let columns = instruments
            .iter()
            .map(|name| {
                self.column(name).map(<[f64]>::to_vec).ok_or_else(|| {
                    MarkowitzError::invalid_input(format!("unknown instrument {}", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(self.dates.clone(), instruments.to_vec(), columns)
    }

    /// Keeps the rows dated on or after `start`.
    pub fn since(&self, start: NaiveDate) -> Result<Self> {
        let first = self.dates.partition_point(|d| *d < start);
        Self::new(
            self.dates[first..].to_vec(),
            self.instruments.clone(),
            self.columns.iter().map(|c| c[first..].to_vec()).collect(),
        )
    }

    pub fn returns(&self) -> Result<ReturnMatrix> {
        ReturnMatrix::new(
            self.dates.iter().skip(1).copied().collect(),
            self.instruments.clone(),
            self.columns.iter().map(|c| to_returns(c)).collect(),
        )
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    pub fn column(&self, instrument: &str) -> Option<&[f64]> {
        self.instruments
            .iter()
            .position(|i| i == instrument)
            .map(|idx| self.columns[idx].as_slice())
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }
}

impl ReturnMatrix {
    pub fn new(dates: Vec<NaiveDate>, instruments: Vec<String>, columns: Vec<Vec<f64>>) -> Result<Self> {
        check_shape(&dates, &instruments, &columns)?;
        for (name, column) in instruments.iter().zip(&columns) {
            if column.iter().any(|r| !r.is_finite()) {
                return Err(MarkowitzError::invalid_input(format!(
                    "{} has a non-finite return",
                    name
                )));
            }
        }
        Ok(Self {
            dates,
            instruments,
            columns,
        })
    }

    /// Multiplies each column by its factor, in instrument order.
    pub fn scaled(&self, factors: &[f64]) -> Result<Self> {
        if factors.len() != self.instruments.len() {
            return Err(MarkowitzError::length_mismatch(self.instruments.len(), factors.len()));
        }
        Self::new(
            self.dates.clone(),
            self.instruments.clone(),
            self.columns
                .iter()
                .zip(factors)
                .map(|(c, f)| c.iter().map(|r| r * f).collect())
                .collect(),
        )
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    pub fn columns(&self) -> &[Vec<f64>] {
        &self.columns
    }

    pub fn column(&self, instrument: &str) -> Option<&[f64]> {
        self.instruments
            .iter()
            .position(|i| i == instrument)
            .map(|idx| self.columns[idx].as_slice())
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn means(&self) -> Vec<f64> {
        self.columns.iter().map(|c| mean(c)).collect()
    }

    pub fn covariance(&self) -> Vec<Vec<f64>> {
        covariance_matrix(&self.columns)
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| raw.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::bar;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 5, day).unwrap()
    }

    #[test]
    fn test_join_two_tables() {
        let a = PriceTable::ohlc(vec![bar(14, 1.0, "TICKERA"), bar(15, 2.0, "TICKERA"), bar(16, 3.0, "TICKERA")]);
        let b = PriceTable::ohlc(vec![bar(14, 3.0, "TICKERB"), bar(15, 4.0, "TICKERB"), bar(16, 5.0, "TICKERB")]);
        let joined = PriceMatrix::join(&[a, b]).unwrap();

        assert_eq!(joined.instruments(), &["TICKERA".to_string(), "TICKERB".to_string()]);
        assert_eq!((joined.len(), joined.instruments().len()), (3, 2));
        assert_eq!(joined.column("TICKERB").unwrap(), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_join_drops_dates_missing_anywhere() {
        let a = PriceTable::ohlc(vec![bar(14, 1.0, "A"), bar(15, 2.0, "A"), bar(16, 3.0, "A")]);
        let b = PriceTable::ohlc(vec![bar(14, 3.0, "B"), bar(16, 5.0, "B"), bar(17, 6.0, "B")]);
        let joined = PriceMatrix::join(&[a, b]).unwrap();
        assert_eq!(joined.dates(), &[d(14), d(16)]);
        assert_eq!(joined.column("A").unwrap(), &[1.0, 3.0]);
    }

    #[test]
    fn test_join_rejects_invalid_table() {
        let a = PriceTable::ohlc(vec![bar(14, 1.0, "A")]);
        let b = PriceTable::ohlc(Vec::new()).with_ticker("B");
        assert!(PriceMatrix::join(&[a, b]).is_err());
    }

    #[test]
    fn test_new_rejects_bad_shapes() {
        assert!(PriceMatrix::new(vec![], vec!["A".into()], vec![vec![]]).is_err());
        assert!(PriceMatrix::new(vec![d(14)], vec![], vec![]).is_err());
        assert!(PriceMatrix::new(vec![d(14), d(15)], vec!["A".into()], vec![vec![1.0]]).is_err());
        assert!(PriceMatrix::new(vec![d(15), d(14)], vec!["A".into()], vec![vec![1.0, 2.0]]).is_err());
        assert!(
            PriceMatrix::new(vec![d(14)], vec!["A".into(), "A".into()], vec![vec![1.0], vec![1.0]]).is_err()
        );
        assert!(PriceMatrix::new(vec![d(14)], vec!["A".into()], vec![vec![0.0]]).is_err());
    }

    #[test]
    fn test_returns_drop_first_row() {
        let prices = PriceMatrix::new(
            vec![d(14), d(15), d(16)],
            vec!["A".into(), "B".into()],
            vec![vec![100.0, 110.0, 121.0], vec![50.0, 25.0, 50.0]],
        )
        .unwrap();
        let returns = prices.returns().unwrap();
        assert_eq!(returns.dates(), &[d(15), d(16)]);
        assert_relative_eq!(returns.column("A").unwrap()[1], 0.10, epsilon = 1e-12);
        assert_relative_eq!(returns.column("B").unwrap()[0], -0.5, epsilon = 1e-12);
        assert_relative_eq!(returns.means()[1], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_select_and_since() {
        let prices = PriceMatrix::new(
            vec![d(14), d(15), d(16)],
            vec!["A".into(), "B".into()],
            vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
        )
        .unwrap();
        let picked = prices.select(&["B".to_string()]).unwrap();
        assert_eq!(picked.instruments(), &["B".to_string()]);
        assert!(prices.select(&["C".to_string()]).is_err());

        let later = prices.since(d(15)).unwrap();
        assert_eq!(later.dates(), &[d(15), d(16)]);
        assert_eq!(later.column("A").unwrap(), &[2.0, 3.0]);
        assert!(prices.since(d(20)).is_err());
    }

    #[test]
    fn test_from_csv_drops_incomplete_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Date,BOVA11.SA,SMAL11.SA").unwrap();
        writeln!(file, "2023-01-03,104.5,98.1").unwrap();
        writeln!(file, "2023-01-02,105.0,").unwrap();
        writeln!(file, "2023-01-04 00:00:00,106.0,99.0").unwrap();
        file.flush().unwrap();

        let prices = PriceMatrix::from_csv(file.path(), &[]).unwrap();
        assert_eq!(prices.instruments(), &["BOVA11.SA".to_string(), "SMAL11.SA".to_string()]);
        assert_eq!(prices.len(), 2);
        assert_eq!(prices.dates()[0], NaiveDate::from_ymd_opt(2023, 1, 3).unwrap());
        assert_eq!(prices.column("SMAL11.SA").unwrap(), &[98.1, 99.0]);
    }

    #[test]
    fn test_from_csv_ignores_gaps_in_unrequested_columns() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Date,ITSA4,PETR4,VALE3").unwrap();
        writeln!(file, "2023-01-02,8.1,23.0,87.0").unwrap();
        writeln!(file, "2023-01-03,8.2,22.5,").unwrap();
        writeln!(file, "2023-01-04,8.3,,89.0").unwrap();
        file.flush().unwrap();

        let both = PriceMatrix::from_csv(file.path(), &["ITSA4".to_string(), "VALE3".to_string()]).unwrap();
        assert_eq!(
            both.dates(),
            &[
                NaiveDate::from_ymd_opt(2023, 1, 2).unwrap(),
                NaiveDate::from_ymd_opt(2023, 1, 4).unwrap()
            ]
        );

        let itsa = PriceMatrix::from_csv(file.path(), &["ITSA4".to_string()]).unwrap();
        assert_eq!(itsa.len(), 3);
        assert_eq!(itsa.column("ITSA4").unwrap(), &[8.1, 8.2, 8.3]);
    }

    #[test]
    fn test_from_csv_matches_headers_case_insensitively() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Date, itsa4 ,Petr4").unwrap();
        writeln!(file, "2023-01-02,8.1,23.0").unwrap();
        writeln!(file, "2023-01-03,8.2,22.5").unwrap();
        file.flush().unwrap();

        let prices = PriceMatrix::from_csv(file.path(), &["PETR4".to_string(), "ITSA4".to_string()]).unwrap();
        assert_eq!(prices.instruments(), &["PETR4".to_string(), "ITSA4".to_string()]);
        assert_eq!(prices.column("ITSA4").unwrap(), &[8.1, 8.2]);
        assert!(PriceMatrix::from_csv(file.path(), &["VALE3".to_string()]).is_err());
    }

    #[test]
    fn test_scaled_multiplies_columns() {
        let returns = ReturnMatrix::new(
            vec![d(15), d(16)],
            vec!["A".into(), "B".into()],
            vec![vec![0.01, 0.02], vec![0.03, -0.01]],
        )
        .unwrap();
        let scaled = returns.scaled(&[2.0, 0.5]).unwrap();
        assert_relative_eq!(scaled.column("A").unwrap()[1], 0.04, epsilon = 1e-12);
        assert_relative_eq!(scaled.column("B").unwrap()[0], 0.015, epsilon = 1e-12);
        assert!(returns.scaled(&[1.0]).is_err());
    }
}
