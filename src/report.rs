use crate::optimizer::{OptimizationResult, PortfolioSample};
use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Read-only summary and file exports over an [`OptimizationResult`].
pub struct PortfolioReport<'a> {
    result: &'a OptimizationResult,
}

impl<'a> PortfolioReport<'a> {
    pub fn new(result: &'a OptimizationResult) -> Self {
        Self { result }
    }

    /// `(instrument, weight)` pairs in instrument order.
    pub fn weights(&self, sample: &PortfolioSample) -> Vec<(String, f64)> {
        self.result
            .instrument_order
            .iter()
            .cloned()
            .zip(sample.weights.iter().copied())
            .collect()
    }

    /// One row per sample: `ret,stdev,sharpe,<instrument weights...>`.
    pub fn write_samples_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let samples = self
            .result
            .samples
            .as_ref()
            .ok_or_else(|| anyhow!("sample population was not retained for this run"))?;
        ensure_parent(path)?;

        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(self.header(false))?;
        for s in samples {
            writer.write_record(sample_record(None, s))?;
        }
        writer.flush()?;
        info!("Wrote {} samples to {}", samples.len(), path.display());
        Ok(())
    }

    /// The two extremal portfolios, labelled in a leading `portfolio` column.
    pub fn write_extremes_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        ensure_parent(path)?;

        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(self.header(true))?;
        writer.write_record(sample_record(Some("max_sharpe"), &self.result.max_sharpe_portfolio))?;
        writer.write_record(sample_record(
            Some("min_volatility"),
            &self.result.min_volatility_portfolio,
        ))?;
        writer.flush()?;
        Ok(())
    }

    fn header(&self, labelled: bool) -> Vec<String> {
        let mut header: Vec<String> = Vec::with_capacity(self.result.instrument_order.len() + 4);
        if labelled {
            header.push("portfolio".to_string());
        }
        header.extend(["ret", "stdev", "sharpe"].map(String::from));
        header.extend(self.result.instrument_order.iter().cloned());
        header
    }

    /// Writes the volatility/return scatter as HTML. Returns `None` when
    /// running headless or without the `charts` feature.
    pub fn write_chart(&self, path: impl AsRef<Path>, headless: bool) -> Result<Option<PathBuf>> {
        let path = path.as_ref();
        if headless {
            info!("Headless mode: skipping chart {}", path.display());
            return Ok(None);
        }
        self.render_chart(path)
    }

    #[cfg(feature = "charts")]
    fn render_chart(&self, path: &Path) -> Result<Option<PathBuf>> {
        use plotly::common::{ColorScale, ColorScalePalette, Marker, MarkerSymbol, Mode, Title};
        use plotly::layout::Axis;
        use plotly::{Layout, Plot, Scatter};

        let mut plot = Plot::new();

        if let Some(samples) = &self.result.samples {
            let vols: Vec<f64> = samples.iter().map(|s| s.annualized_volatility).collect();
            let rets: Vec<f64> = samples.iter().map(|s| s.annualized_return).collect();
            let sharpes: Vec<f64> = samples.iter().map(|s| s.sharpe).collect();
            plot.add_trace(
                Scatter::new(vols, rets)
                    .name("portfolios")
                    .mode(Mode::Markers)
                    .marker(
                        Marker::new()
                            .size(4)
                            .color_array(sharpes)
                            .color_scale(ColorScale::Palette(ColorScalePalette::RdBu))
                            .show_scale(true),
                    ),
            );
        }

        for (label, sample, color) in [
            ("max Sharpe", &self.result.max_sharpe_portfolio, "red"),
            ("min volatility", &self.result.min_volatility_portfolio, "green"),
        ] {
            let weights = self
                .weights(sample)
                .iter()
                .map(|(name, w)| format!("{} {:.1}%", name, w * 100.0))
                .collect::<Vec<_>>()
                .join(", ");
            plot.add_trace(
                Scatter::new(vec![sample.annualized_volatility], vec![sample.annualized_return])
                    .name(format!("{} ({})", label, weights))
                    .mode(Mode::Markers)
                    .marker(Marker::new().size(22).symbol(MarkerSymbol::Star).color(color)),
            );
        }

        plot.set_layout(
            Layout::new()
                .title(Title::from(
                    format!("Markowitz simulation: {}", self.result.instrument_order.join(", ")).as_str(),
                ))
                .x_axis(Axis::new().title(Title::from("Volatility")))
                .y_axis(Axis::new().title(Title::from("Returns"))),
        );

        ensure_parent(path)?;
        plot.write_html(path);
        info!("Chart written to {}", path.display());
        Ok(Some(path.to_path_buf()))
    }

    #[cfg(not(feature = "charts"))]
    fn render_chart(&self, path: &Path) -> Result<Option<PathBuf>> {
        info!(
            "Built without the `charts` feature; skipping chart {}",
            path.display()
        );
        Ok(None)
    }
}

fn sample_record(label: Option<&str>, s: &PortfolioSample) -> Vec<String> {
    label
        .map(str::to_string)
        .into_iter()
        .chain([s.annualized_return, s.annualized_volatility, s.sharpe].map(|v| v.to_string()))
        .chain(s.weights.iter().map(|w| w.to_string()))
        .collect()
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed creating report directory {:?}", parent))?;
    }
    Ok(())
}

fn write_portfolio(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    headline: String,
    sample: &PortfolioSample,
    weights: &[(String, f64)],
) -> fmt::Result {
    writeln!(f, "╠════════════════════════════════════════════════════════════╣")?;
    writeln!(f, "║  {:<58}║", title)?;
    writeln!(f, "║  {:<58}║", headline)?;
    writeln!(
        f,
        "║  Annual Return : {:>+8.2}%   Annual Vol : {:>7.2}%        ║",
        sample.annualized_return * 100.0,
        sample.annualized_volatility * 100.0
    )?;
    writeln!(f, "║  Sharpe Ratio  : {:>8.4}                                  ║", sample.sharpe)?;
    for (name, w) in weights {
        writeln!(f, "║    {:<14} {:>7.2}%                                  ║", name, w * 100.0)?;
    }
    Ok(())
}

impl fmt::Display for PortfolioReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.result;
        writeln!(f, "╔════════════════════════════════════════════════════════════╗")?;
        writeln!(f, "║           Markowitz Portfolio Simulation                   ║")?;
        writeln!(
            f,
            "║  {:<58}║",
            format!("{} random portfolios over {} assets", r.sample_count, r.instrument_order.len())
        )?;
        if let Some(seed) = r.seed {
            writeln!(f, "║  {:<58}║", format!("seed {}", seed))?;
        }

        write_portfolio(
            f,
            "Maximum Sharpe portfolio",
            format!("max Sharpe: {:.3}", r.max_sharpe_portfolio.sharpe),
            &r.max_sharpe_portfolio,
            &self.weights(&r.max_sharpe_portfolio),
        )?;
        write_portfolio(
            f,
            "Minimum volatility portfolio",
            format!("min vol: {:.3} %", r.min_volatility_portfolio.annualized_volatility * 100.0),
            &r.min_volatility_portfolio,
            &self.weights(&r.min_volatility_portfolio),
        )?;

        if !r.warnings.is_empty() {
            writeln!(f, "╠════════════════════════════════════════════════════════════╣")?;
            for w in &r.warnings {
                writeln!(f, "║  ⚠ {:<56}║", w.to_string())?;
            }
        }
        writeln!(f, "╚════════════════════════════════════════════════════════════╝")?;
        write!(f, "⚠  Educational use only. Not financial advice.")
    }
}
