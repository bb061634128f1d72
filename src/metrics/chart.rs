//! Chart rendering for flushed run metrics.

use std::path::Path;

use anyhow::{anyhow, Result};
use plotters::prelude::*;

/// One line plot: `(x, y)` points plus axis text.
#[derive(Clone, Debug, PartialEq)]
pub struct ChartSeries {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub points: Vec<(f64, f64)>,
}

/// Renders one image with a panel per series, side by side.
pub trait ChartRenderer: Send + Sync {
    fn render_line_chart(&self, series: &[ChartSeries], output: &Path) -> Result<()>;
}

/// PNG output through plotters' bitmap backend.
pub struct PlottersRenderer {
    pub panel_width: u32,
    pub height: u32,
}

impl Default for PlottersRenderer {
    fn default() -> Self {
        Self {
            panel_width: 600,
            height: 500,
        }
    }
}

const PALETTE: [RGBColor; 2] = [BLUE, RGBColor(255, 165, 0)];

impl ChartRenderer for PlottersRenderer {
    fn render_line_chart(&self, series: &[ChartSeries], output: &Path) -> Result<()> {
        if series.is_empty() {
            return Err(anyhow!("no series to render"));
        }
        let size = (self.panel_width * series.len() as u32, self.height);
        let root = BitMapBackend::new(output, size).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;

        let panels = root.split_evenly((1, series.len()));
        for (index, (panel, data)) in panels.iter().zip(series).enumerate() {
            draw_panel(panel, data, PALETTE[index % PALETTE.len()])?;
        }

        root.present().map_err(plot_err)?;
        Ok(())
    }
}

fn draw_panel(
    area: &DrawingArea<BitMapBackend, plotters::coord::Shift>,
    data: &ChartSeries,
    color: RGBColor,
) -> Result<()> {
    let x_max = data
        .points
        .iter()
        .map(|(x, _)| *x)
        .fold(1.0_f64, f64::max);
    let y_max = data
        .points
        .iter()
        .map(|(_, y)| *y)
        .fold(1.0_f64, f64::max)
        * 1.1;

    let mut chart = ChartBuilder::on(area)
        .caption(&data.title, ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(35)
        .y_label_area_size(50)
        .build_cartesian_2d(0.0..x_max, 0.0..y_max)
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc(data.x_label.as_str())
        .y_desc(data.y_label.as_str())
        .draw()
        .map_err(plot_err)?;

    chart
        .draw_series(LineSeries::new(data.points.iter().copied(), &color))
        .map_err(plot_err)?
        .label(data.y_label.as_str())
        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(plot_err)?;
    Ok(())
}

fn plot_err<E: std::fmt::Display>(err: E) -> anyhow::Error {
    anyhow!("chart rendering failed: {err}")
}

/// Renderer that skips chart output.
pub struct NullRenderer;

impl ChartRenderer for NullRenderer {
    fn render_line_chart(&self, _series: &[ChartSeries], _output: &Path) -> Result<()> {
        Ok(())
    }
}
