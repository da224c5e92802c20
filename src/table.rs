use crate::error::{MarkowitzError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::path::Path;

/// The six columns every canonical table carries, in order.
pub const TABLE_COLUMNS: [&str; 6] = ["time", "open", "high", "low", "close", "volume"];

/// Represents a single candlestick data point (OHLCV).
#[derive(Clone, Debug, PartialEq)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn date(&self) -> NaiveDate {
        self.time.date_naive()
    }
}

/// A provider row before normalization. Any canonical column may be absent.
#[derive(Clone, Debug, Default)]
pub struct RawBar {
    pub time: Option<DateTime<Utc>>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub ticker: Option<String>,
    pub timeframe: Option<String>,
}

impl RawBar {
    pub fn is_complete(&self) -> bool {
        self.to_candle().is_some()
    }

    fn to_candle(&self) -> Option<Candle> {
        Some(Candle {
            time: self.time?,
            open: self.open?,
            high: self.high?,
            low: self.low?,
            close: self.close?,
            volume: self.volume?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    /// Provider OHLCV data: sorted by time, ticker/timeframe tags extracted.
    Ohlc,
    /// Computed data: kept in the order it was produced, no tag extraction.
    Derived,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableInfo {
    pub ticker: Option<String>,
    pub timeframe: Option<String>,
    pub source: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PriceTable {
    kind: TableKind,
    candles: Vec<Candle>,
    info: TableInfo,
    valid: bool,
}

impl PriceTable {
    pub fn ohlc(raw: Vec<RawBar>) -> Self {
        Self::parse(TableKind::Ohlc, raw)
    }

    pub fn derived(raw: Vec<RawBar>) -> Self {
        Self::parse(TableKind::Derived, raw)
    }

    /// Shared validation: a table is valid when every row carries all six
    /// canonical columns. An empty table has no columns and is invalid.
    fn parse(kind: TableKind, raw: Vec<RawBar>) -> Self {
        let candles: Option<Vec<Candle>> = if raw.is_empty() {
            None
        } else {
            raw.iter().map(RawBar::to_candle).collect()
        };

        let Some(mut candles) = candles else {
            return Self {
                kind,
                candles: Vec::new(),
                info: TableInfo::default(),
                valid: false,
            };
        };

        let mut info = TableInfo::default();
        if kind == TableKind::Ohlc {
            info.ticker = raw[0].ticker.clone();
            info.timeframe = raw[0].timeframe.clone();
            candles.sort_by_key(|c| c.time);
        }

        Self {
            kind,
            candles,
            info,
            valid: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Turns an invalid table into an `InvalidInput` error.
    pub fn validated(self) -> Result<Self> {
        if self.valid {
            Ok(self)
        } else {
            Err(MarkowitzError::invalid_input(format!(
                "{:?} price table for {} is missing canonical columns {:?}",
                self.kind,
                self.info.ticker.as_deref().unwrap_or("<unknown>"),
                TABLE_COLUMNS
            )))
        }
    }

    pub fn with_ticker(mut self, ticker: impl Into<String>) -> Self {
        self.info.ticker = Some(ticker.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.info.source = Some(source.into());
        self
    }

    pub fn ticker(&self) -> Option<&str> {
        self.info.ticker.as_deref()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }


    /// Writes `time,<ticker>` close prices in ascending time order.
    pub fn save_price(&self, path: impl AsRef<Path>) -> Result<()> {
        let ticker = self
            .ticker()
            .ok_or_else(|| MarkowitzError::invalid_input("cannot export prices without a ticker"))?;

        let intraday = self
            .info
            .timeframe
            .as_deref()
            .is_some_and(|tf| !matches!(tf.to_ascii_uppercase().as_str(), "D1" | "1D"));

        let mut sorted: Vec<&Candle> = self.candles.iter().collect();
        sorted.sort_by_key(|c| c.time);

        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["time", ticker])?;
        for candle in sorted {
            let time = if intraday {
                candle.time.format("%Y-%m-%d %H:%M:%S").to_string()
            } else {
                candle.date().format("%Y-%m-%d").to_string()
            };
            writer.write_record([time, candle.close.to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }
}
