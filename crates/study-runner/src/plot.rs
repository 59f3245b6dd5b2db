use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use plotters::prelude::*;

use crate::ensure_dir;

const CHART_SIZE: (u32, u32) = (960, 720);

fn draw_err<E: std::fmt::Display>(err: E) -> anyhow::Error {
    anyhow!("chart rendering failed: {}", err)
}

#[derive(Debug, Clone)]
pub struct Series {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

/// Comparison chart accumulating one labeled line per variant until an
/// explicit `finalize` saves the figure. An owned value, not hidden
/// process-wide plotting state.
#[derive(Debug)]
pub struct ScalingChart {
    x_label: String,
    y_label: String,
    log_x: bool,
    series: Vec<Series>,
}

impl ScalingChart {
    pub fn new(x_label: impl Into<String>, y_label: impl Into<String>, log_x: bool) -> ScalingChart {
        ScalingChart {
            x_label: x_label.into(),
            y_label: y_label.into(),
            log_x,
            series: Vec::new(),
        }
    }

    /// Adds one labeled series. Points are sorted by x on insertion:
    /// queue-backed sweeps complete out of submission order, but the
    /// rendered line must be monotonically non-decreasing in x.
    pub fn add_series(&mut self, label: impl Into<String>, mut points: Vec<(f64, f64)>) {
        points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        self.series.push(Series {
            label: label.into(),
            points,
        });
    }

    pub fn series(&self) -> &[Series] {
        &self.series
    }

    pub fn is_empty(&self) -> bool {
        self.series.iter().all(|s| s.points.is_empty())
    }

    /// Draws every accumulated series onto one figure and saves it,
    /// consuming the chart.
    pub fn finalize(self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }
        let root = SVGBackend::new(path, CHART_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;

        if self.is_empty() {
            // Best-effort: a study where nothing succeeded still saves
            // an (empty) figure rather than erroring.
            root.present().map_err(draw_err)?;
            return Ok(());
        }

        let mut x_min = f64::INFINITY;
        let mut x_max = f64::NEG_INFINITY;
        let mut y_max = f64::NEG_INFINITY;
        for series in &self.series {
            for &(x, y) in &series.points {
                x_min = x_min.min(x);
                x_max = x_max.max(x);
                y_max = y_max.max(y);
            }
        }
        if self.log_x && x_min <= 0.0 {
            x_min = 1.0;
        }
        if x_max <= x_min {
            x_max = x_min + 1.0;
        }
        let y_max = if y_max <= 0.0 { 1.0 } else { y_max * 1.1 };

        let mut builder = ChartBuilder::on(&root);
        builder
            .margin(24)
            .x_label_area_size(48)
            .y_label_area_size(64);

        if self.log_x {
            let mut chart = builder
                .build_cartesian_2d((x_min..x_max).log_scale(), 0.0f64..y_max)
                .map_err(draw_err)?;
            chart
                .configure_mesh()
                .x_desc(self.x_label.as_str())
                .y_desc(self.y_label.as_str())
                .draw()
                .map_err(draw_err)?;
            for (idx, series) in self.series.iter().enumerate() {
                let color = Palette99::pick(idx).mix(0.9);
                chart
                    .draw_series(LineSeries::new(series.points.iter().copied(), &color))
                    .map_err(draw_err)?
                    .label(series.label.clone())
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
            }
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()
                .map_err(draw_err)?;
        } else {
            let mut chart = builder
                .build_cartesian_2d(x_min..x_max, 0.0f64..y_max)
                .map_err(draw_err)?;
            chart
                .configure_mesh()
                .x_desc(self.x_label.as_str())
                .y_desc(self.y_label.as_str())
                .draw()
                .map_err(draw_err)?;
            for (idx, series) in self.series.iter().enumerate() {
                let color = Palette99::pick(idx).mix(0.9);
                chart
                    .draw_series(LineSeries::new(series.points.iter().copied(), &color))
                    .map_err(draw_err)?
                    .label(series.label.clone())
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
            }
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()
                .map_err(draw_err)?;
        }

        root.present().map_err(draw_err)?;
        Ok(())
    }
}

/// Clustering-assignment rows pulled out of a clusters CSV: three
/// feature axes plus the cluster label of each row.
#[derive(Debug, Clone)]
pub struct ClusterScatter {
    pub x_label: String,
    pub y_label: String,
    pub z_label: String,
    pub points: Vec<(f64, f64, f64)>,
    pub clusters: Vec<String>,
}

impl ClusterScatter {
    pub fn from_csv(path: &Path, axis_x: &str, axis_y: &str, axis_z: &str) -> Result<ClusterScatter> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("cannot read clusters file {}", path.display()))?;
        let headers = reader.headers().context("clusters file has no header")?.clone();
        let col = |name: &str| -> Result<usize> {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| anyhow!("column `{}` not found in {}", name, path.display()))
        };
        let (ix, iy, iz) = (col(axis_x)?, col(axis_y)?, col(axis_z)?);
        let ic = col("cluster")?;

        let mut points = Vec::new();
        let mut clusters = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("malformed row in {}", path.display()))?;
            let field = |idx: usize| -> Result<f64> {
                record
                    .get(idx)
                    .ok_or_else(|| anyhow!("short row in {}", path.display()))?
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("non-numeric value in {}", path.display()))
            };
            points.push((field(ix)?, field(iy)?, field(iz)?));
            clusters.push(
                record
                    .get(ic)
                    .ok_or_else(|| anyhow!("short row in {}", path.display()))?
                    .trim()
                    .to_string(),
            );
        }
        if points.is_empty() {
            bail!("no data rows in {}", path.display());
        }
        Ok(ClusterScatter {
            x_label: axis_x.to_string(),
            y_label: axis_y.to_string(),
            z_label: axis_z.to_string(),
            points,
            clusters,
        })
    }

    /// One color per unique cluster label, stable within this render
    /// call. Stability across separate calls is not guaranteed.
    pub fn label_colors(&self) -> BTreeMap<&str, HSLColor> {
        let mut order: Vec<&str> = Vec::new();
        for label in &self.clusters {
            if !order.iter().any(|l| l == label) {
                order.push(label);
            }
        }
        let total = order.len().max(1) as f64;
        order
            .iter()
            .enumerate()
            .map(|(idx, &label)| (label, HSLColor(idx as f64 / total, 0.65, 0.5)))
            .collect()
    }

    /// Renders the labeled 3-D scatter and saves it.
    pub fn render(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }
        let colors = self.label_colors();

        let (mut x_min, mut x_max) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut y_min, mut y_max) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut z_min, mut z_max) = (f64::INFINITY, f64::NEG_INFINITY);
        for &(x, y, z) in &self.points {
            x_min = x_min.min(x);
            x_max = x_max.max(x);
            y_min = y_min.min(y);
            y_max = y_max.max(y);
            z_min = z_min.min(z);
            z_max = z_max.max(z);
        }
        let pad = |min: &mut f64, max: &mut f64| {
            if *max <= *min {
                *max = *min + 1.0;
            }
        };
        pad(&mut x_min, &mut x_max);
        pad(&mut y_min, &mut y_max);
        pad(&mut z_min, &mut z_max);

        let root = SVGBackend::new(path, CHART_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(24)
            .caption(
                format!("{} / {} / {}", self.x_label, self.y_label, self.z_label),
                ("sans-serif", 20),
            )
            .build_cartesian_3d(x_min..x_max, y_min..y_max, z_min..z_max)
            .map_err(draw_err)?;
        chart.configure_axes().draw().map_err(draw_err)?;
        chart
            .draw_series(
                self.points
                    .iter()
                    .zip(&self.clusters)
                    .map(|(&(x, y, z), label)| {
                        let color = colors
                            .get(label.as_str())
                            .copied()
                            .unwrap_or(HSLColor(0.0, 0.0, 0.4));
                        Circle::new((x, y, z), 3, color.filled())
                    }),
            )
            .map_err(draw_err)?;
        root.present().map_err(draw_err)?;
        Ok(())
    }
}
