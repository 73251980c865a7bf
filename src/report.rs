//! The report printed once benchmarking completes.
//!
//! Rendered either as plain text tables for a human or as JSON for whatever
//! consumes the numbers downstream. Figures are pre-formatted into human
//! readable strings in both renderings; the raw values live in the results
//! themselves.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::blueprint::DataBlueprint;
use crate::nodes::basename;
use crate::results::{BenchmarkResult, Stats};

/// Everything a report can be built from.
pub struct ReportOptions<'a> {
    pub data: &'a DataBlueprint,
    pub stats: Option<Stats>,
    pub results: &'a [BenchmarkResult],
    pub cluster_logs: Vec<PathBuf>,
    pub backup_logs: Option<PathBuf>,
}

/// The complete benchmark report.
#[derive(Serialize)]
pub struct Report {
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<StatsSection>,
    overview: Overview,
    rundown: Vec<RundownRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logs: Option<Logs>,
}

impl Report {
    pub fn new(options: ReportOptions<'_>) -> Self {
        Report {
            stats: options.stats.map(StatsSection::new),
            overview: Overview::new(options.data, options.results),
            rundown: options
                .results
                .iter()
                .map(|result| RundownRow::new(options.data, result))
                .collect(),
            logs: Logs::new(&options.cluster_logs, options.backup_logs.as_deref()),
        }
    }

    /// Print the report to stdout, either human readable or as JSON.
    pub fn print(&self, json: bool) -> Result<()> {
        if !json {
            println!("{self}");
            return Ok(());
        }

        println!("{}", serde_json::to_string(self)?);

        Ok(())
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sections = Vec::new();

        if let Some(stats) = &self.stats {
            sections.push(stats.render());
        }

        sections.push(self.overview.render());
        sections.push(render_rundown(&self.rundown));

        if let Some(logs) = &self.logs {
            sections.push(logs.render());
        }

        f.write_str(&sections.join("\n\n"))
    }
}

/// Bucket stats at the time the benchmarks finished.
#[derive(Serialize)]
struct StatsSection {
    item_count: u64,
    memory_used: String,
    disk_used: String,
    residency_ratio: u64,
}

impl StatsSection {
    fn new(stats: Stats) -> Self {
        StatsSection {
            item_count: stats.item_count,
            memory_used: format_bytes(stats.mem_used),
            disk_used: format_bytes(stats.disk_used),
            residency_ratio: stats.residency_ratio(),
        }
    }

    fn render(&self) -> String {
        render_table(
            "Stats",
            &["Item Count", "Memory Used", "Disk Used", "Residency Ratio"],
            &[vec![
                self.item_count.to_string(),
                self.memory_used.clone(),
                self.disk_used.clone(),
                format!("{}%", self.residency_ratio),
            ]],
        )
    }
}

/// Averages across the benchmark iterations. "Actual" figures come from the
/// repository; "generated" figures are the logical dataset size.
#[derive(Serialize)]
struct Overview {
    avg_duration: String,
    avg_actual_size: String,
    avg_generated_size: String,
    avg_transfer_rate_actual: String,
    avg_transfer_rate_generated: String,
}

impl Overview {
    fn new(data: &DataBlueprint, results: &[BenchmarkResult]) -> Self {
        let count = results.len().max(1) as u64;

        let mut duration = Duration::ZERO;
        let (mut actual, mut rate_actual, mut rate_generated) = (0u64, 0u64, 0u64);

        for result in results {
            duration += result.duration;
            actual += result.actual_size;
            rate_actual += result.transfer_rate_actual();
            rate_generated += result.transfer_rate_generated(data.generated_size());
        }

        Overview {
            avg_duration: format_duration(duration / count as u32),
            avg_actual_size: format_bytes(actual / count),
            avg_generated_size: format_bytes(data.generated_size()),
            avg_transfer_rate_actual: format!("{}/s", format_bytes(rate_actual / count)),
            avg_transfer_rate_generated: format!("{}/s", format_bytes(rate_generated / count)),
        }
    }

    fn render(&self) -> String {
        render_table(
            "Overview",
            &[
                "Avg Duration",
                "Avg Size (Actual)",
                "Size (Generated)",
                "Avg Rate (Actual)",
                "Avg Rate (Generated)",
            ],
            &[vec![
                self.avg_duration.clone(),
                self.avg_actual_size.clone(),
                self.avg_generated_size.clone(),
                self.avg_transfer_rate_actual.clone(),
                self.avg_transfer_rate_generated.clone(),
            ]],
        )
    }
}

/// The detailed figures for a single iteration.
#[derive(Serialize)]
struct RundownRow {
    duration: String,
    items: String,
    actual_size: String,
    generated_size: String,
    transfer_rate_actual: String,
    transfer_rate_generated: String,
}

impl RundownRow {
    fn new(data: &DataBlueprint, result: &BenchmarkResult) -> Self {
        RundownRow {
            duration: format_duration(result.duration),
            items: result.actual_items.to_string(),
            actual_size: format_bytes(result.actual_size),
            generated_size: format_bytes(data.generated_size()),
            transfer_rate_actual: format!("{}/s", format_bytes(result.transfer_rate_actual())),
            transfer_rate_generated: format!(
                "{}/s",
                format_bytes(result.transfer_rate_generated(data.generated_size()))
            ),
        }
    }
}

fn render_rundown(rows: &[RundownRow]) -> String {
    render_table(
        "Rundown",
        &[
            "Iteration",
            "Duration",
            "Items",
            "Size (Actual)",
            "Size (Generated)",
            "Rate (Actual)",
            "Rate (Generated)",
        ],
        &rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                vec![
                    (index + 1).to_string(),
                    row.duration.clone(),
                    row.items.clone(),
                    row.actual_size.clone(),
                    row.generated_size.clone(),
                    row.transfer_rate_actual.clone(),
                    row.transfer_rate_generated.clone(),
                ]
            })
            .collect::<Vec<_>>(),
    )
}

/// Where the collected logs ended up, when log collection ran.
#[derive(Serialize)]
struct Logs {
    cluster: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backup: Option<String>,
}

impl Logs {
    fn new(cluster: &[PathBuf], backup: Option<&std::path::Path>) -> Option<Self> {
        if cluster.is_empty() && backup.is_none() {
            return None;
        }

        Some(Logs {
            cluster: cluster
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
            backup: backup.map(|path| path.display().to_string()),
        })
    }

    fn render(&self) -> String {
        let rows = self
            .cluster
            .iter()
            .chain(self.backup.iter())
            .map(|path| vec![basename(path).to_string()])
            .collect::<Vec<_>>();

        render_table("Logs", &["Path"], &rows)
    }
}

/// Render a titled table with columns padded to their widest cell.
fn render_table(title: &str, headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|header| header.len()).collect();

    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.len());
        }
    }

    let render_row = |cells: &[String]| {
        let mut line = String::from("|");
        for (idx, cell) in cells.iter().enumerate() {
            line.push_str(&format!(" {:<width$} |", cell, width = widths[idx]));
        }
        line
    };

    let mut lines = vec![title.to_string(), "-".repeat(title.len())];

    lines.push(render_row(
        &headers.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
    ));

    for row in rows {
        lines.push(render_row(row));
    }

    lines.join("\n")
}

/// Human readable byte count using binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{bytes}B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{value:.2}{}", UNITS[unit])
}

/// Human readable duration, down to milliseconds for sub-second values.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs == 0 {
        return format!("{}ms", duration.as_millis());
    }

    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> DataBlueprint {
        DataBlueprint {
            items: 1000,
            size: 1024,
            ..DataBlueprint::default()
        }
    }

    fn result(secs: u64, size: u64) -> BenchmarkResult {
        BenchmarkResult {
            duration: Duration::from_secs(secs),
            actual_size: size,
            actual_items: 1000,
        }
    }

    #[test]
    fn format_bytes_picks_sensible_units() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KiB");
        assert_eq!(format_bytes(1_572_864), "1.50MiB");
        assert_eq!(format_bytes(1 << 30), "1.00GiB");
    }

    #[test]
    fn format_duration_breaks_down_components() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h2m5s");
    }

    #[test]
    fn overview_averages_across_iterations() {
        let results = [result(10, 1000), result(20, 3000)];
        let overview = Overview::new(&data(), &results);

        assert_eq!(overview.avg_duration, "15s");
        assert_eq!(overview.avg_actual_size, "1.95KiB");
        assert_eq!(overview.avg_generated_size, "1000.00KiB");
    }

    #[test]
    fn report_renders_every_section() {
        let results = [result(10, 1000)];

        let report = Report::new(ReportOptions {
            data: &data(),
            stats: Some(Stats {
                item_count: 1000,
                disk_used: 4096,
                mem_used: 2048,
                non_resident: 0,
            }),
            results: &results,
            cluster_logs: vec![PathBuf::from("/tmp/logs/collect-10.0.0.1.zip")],
            backup_logs: Some(PathBuf::from("/tmp/logs/backup.zip")),
        });

        let rendered = report.to_string();

        assert!(rendered.contains("Stats"));
        assert!(rendered.contains("Overview"));
        assert!(rendered.contains("Rundown"));
        assert!(rendered.contains("Logs"));
        assert!(rendered.contains("collect-10.0.0.1.zip"));
        assert!(rendered.contains("100%"));
    }

    #[test]
    fn logs_section_is_omitted_when_nothing_was_collected() {
        let results = [result(1, 1)];

        let report = Report::new(ReportOptions {
            data: &data(),
            stats: None,
            results: &results,
            cluster_logs: Vec::new(),
            backup_logs: None,
        });

        assert!(!report.to_string().contains("Logs"));
    }

    #[test]
    fn json_rendering_is_valid() {
        let results = [result(5, 100)];

        let report = Report::new(ReportOptions {
            data: &data(),
            stats: None,
            results: &results,
            cluster_logs: Vec::new(),
            backup_logs: None,
        });

        let encoded = serde_json::to_string(&report).unwrap();
        assert!(encoded.contains("\"overview\""));
        assert!(encoded.contains("\"rundown\""));
        assert!(!encoded.contains("\"logs\""));
    }
}
