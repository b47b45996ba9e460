//! End-of-run aggregation and the machine-readable metrics report.
//!
//! Reads per-instance counters and metric slots after the last worker is
//! reaped; anything fancier than a log summary and a JSON document is
//! someone else's job.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::harness::RunResults;

/// One named metric in the report.
#[derive(Debug, Serialize)]
pub struct MetricReport {
    pub label: String,
    pub value: f64,
}

/// One instance's section of the report.
#[derive(Debug, Serialize)]
pub struct InstanceReport {
    pub instance: u32,
    pub bogo_ops: u64,
    pub bogo_ops_per_sec: f64,
    pub secs_per_bogo_op: f64,
    pub forced_kills: u64,
    pub status: &'static str,
    pub metrics: Vec<MetricReport>,
}

/// The full run report.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub stressor: String,
    pub started_at: DateTime<Utc>,
    pub wall_secs: f64,
    pub workers: u32,
    pub status: &'static str,
    pub total_bogo_ops: u64,
    pub bogo_ops_per_sec: f64,
    pub forced_kills: u64,
    pub instances: Vec<InstanceReport>,
}

impl RunReport {
    /// Assemble the report from collected run results.
    pub fn from_results(results: &RunResults, started_at: DateTime<Utc>) -> Self {
        let wall_secs = results.wall.as_secs_f64();
        let per_sec = |ops: u64| {
            if wall_secs > 0.0 {
                ops as f64 / wall_secs
            } else {
                0.0
            }
        };

        let instances: Vec<InstanceReport> = results
            .instances
            .iter()
            .map(|r| InstanceReport {
                instance: r.instance,
                bogo_ops: r.bogo_ops,
                bogo_ops_per_sec: per_sec(r.bogo_ops),
                secs_per_bogo_op: r.secs_per_op,
                forced_kills: r.forced_kills,
                status: r.status.as_str(),
                metrics: r
                    .metrics
                    .iter()
                    .map(|m| MetricReport {
                        label: m.label.clone(),
                        value: m.value,
                    })
                    .collect(),
            })
            .collect();

        let total_bogo_ops = instances.iter().map(|i| i.bogo_ops).sum();
        let forced_kills = instances.iter().map(|i| i.forced_kills).sum();

        Self {
            stressor: results.stressor.to_string(),
            started_at,
            wall_secs,
            workers: results.workers,
            status: results.status.as_str(),
            total_bogo_ops,
            bogo_ops_per_sec: per_sec(total_bogo_ops),
            forced_kills,
            instances,
        }
    }

    /// Log the summary the way the rest of the program logs: structured,
    /// one line per instance plus one aggregate line.
    pub fn log_summary(&self) {
        for instance in &self.instances {
            tracing::info!(
                stressor = %self.stressor,
                instance = instance.instance,
                bogo_ops = instance.bogo_ops,
                bogo_ops_per_sec = format!("{:.2}", instance.bogo_ops_per_sec),
                forced_kills = instance.forced_kills,
                status = instance.status,
                "instance summary"
            );
            for metric in &instance.metrics {
                tracing::info!(
                    stressor = %self.stressor,
                    instance = instance.instance,
                    label = %metric.label,
                    value = format!("{:.2}", metric.value),
                    "metric"
                );
            }
        }
        tracing::info!(
            stressor = %self.stressor,
            workers = self.workers,
            wall_secs = format!("{:.2}", self.wall_secs),
            total_bogo_ops = self.total_bogo_ops,
            bogo_ops_per_sec = format!("{:.2}", self.bogo_ops_per_sec),
            forced_kills = self.forced_kills,
            status = self.status,
            "run summary"
        );
    }

    /// Write the report as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}
