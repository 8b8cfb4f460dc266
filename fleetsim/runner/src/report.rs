//! End-of-run reports: a machine-readable JSON document and a
//! self-contained HTML summary.

use std::{collections::BTreeMap, fs, io, path::Path};

use fleetsim_chaos::FailureEvent;
use fleetsim_core::metrics::{FleetSample, MetricsSummary, NodeEvent};
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub scenario: String,
    pub description: String,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub duration_ms: u64,
    pub total_nodes: usize,
    pub metrics: MetricsSummary,
    pub samples: Vec<FleetSample>,
    pub failure_events: Vec<FailureEvent>,
    pub cold_start_delays_ms: BTreeMap<String, u64>,
    pub node_events: BTreeMap<String, Vec<NodeEvent>>,
    pub assertion_failures: Vec<String>,
}

impl RunReport {
    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let rendered = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        fs::write(path, rendered)
    }

    pub fn write_html(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.render_html())
    }

    fn render_html(&self) -> String {
        let mut failures_by_type = String::new();
        for (failure_type, count) in &self.metrics.failures_by_type {
            failures_by_type.push_str(&format!(
                "<tr><td>{failure_type}</td><td>{count}</td></tr>\n"
            ));
        }

        let mut failures_by_xid = String::new();
        for (code, count) in &self.metrics.failures_by_xid {
            failures_by_xid.push_str(&format!("<tr><td>XID {code}</td><td>{count}</td></tr>\n"));
        }

        let mut samples = String::new();
        for sample in &self.samples {
            samples.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                sample.at_ms,
                sample.healthy,
                sample.degraded,
                sample.unhealthy,
                sample.total_failures,
            ));
        }

        let assertions = if self.assertion_failures.is_empty() {
            "<p class=\"ok\">all assertions passed</p>".to_owned()
        } else {
            let mut list = String::from("<ul class=\"failed\">");
            for failure in &self.assertion_failures {
                list.push_str(&format!("<li>{}</li>", html_escape(failure)));
            }
            list.push_str("</ul>");
            list
        };

        format!(
            r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>{name} — stress report</title>
<style>
body {{ font-family: sans-serif; margin: 2rem; }}
table {{ border-collapse: collapse; margin-bottom: 1.5rem; }}
td, th {{ border: 1px solid #999; padding: 0.3rem 0.8rem; }}
.ok {{ color: #2a7f2a; }}
.failed li {{ color: #a02020; }}
</style>
</head>
<body>
<h1>{name}</h1>
<p>{description}</p>
<table>
<tr><th>nodes</th><td>{nodes}</td></tr>
<tr><th>duration</th><td>{duration_ms} ms</td></tr>
<tr><th>failures</th><td>{failures}</td></tr>
<tr><th>recoveries</th><td>{recoveries}</td></tr>
<tr><th>avg rpc latency</th><td>{avg_latency} ms</td></tr>
<tr><th>max rpc latency</th><td>{max_latency} ms</td></tr>
</table>
<h2>Failures by type</h2>
<table><tr><th>type</th><th>count</th></tr>
{failures_by_type}</table>
<h2>Failures by XID</h2>
<table><tr><th>code</th><th>count</th></tr>
{failures_by_xid}</table>
<h2>Samples</h2>
<table><tr><th>t (ms)</th><th>healthy</th><th>degraded</th><th>unhealthy</th><th>failures</th></tr>
{samples}</table>
<h2>Assertions</h2>
{assertions}
</body>
</html>
"#,
            name = html_escape(&self.scenario),
            description = html_escape(&self.description),
            nodes = self.total_nodes,
            duration_ms = self.duration_ms,
            failures = self.metrics.total_failures,
            recoveries = self.metrics.total_recoveries,
            avg_latency = self.metrics.avg_latency_ms,
            max_latency = self.metrics.max_latency_ms,
        )
    }
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> RunReport {
        RunReport {
            scenario: "smoke".to_owned(),
            description: "a <test> run".to_owned(),
            started_at_ms: 0,
            finished_at_ms: 60_000,
            duration_ms: 60_000,
            total_nodes: 3,
            metrics: MetricsSummary {
                total_failures: 2,
                total_recoveries: 1,
                failures_by_type: [("xid_error".to_owned(), 2u64)].into_iter().collect(),
                failures_by_xid: [(79u32, 2u64)].into_iter().collect(),
                node_status: BTreeMap::new(),
                avg_latency_ms: 3,
                max_latency_ms: 9,
            },
            samples: Vec::new(),
            failure_events: Vec::new(),
            cold_start_delays_ms: BTreeMap::new(),
            node_events: BTreeMap::new(),
            assertion_failures: Vec::new(),
        }
    }

    #[test]
    fn json_report_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.json");
        sample_report().write_json(&path).expect("writes");

        let raw = fs::read_to_string(&path).expect("reads");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(value["scenario"], "smoke");
        assert_eq!(value["metrics"]["failures_by_xid"]["79"], 2);
    }

    #[test]
    fn html_report_escapes_and_includes_totals() {
        let html = sample_report().render_html();
        assert!(html.contains("a &lt;test&gt; run"));
        assert!(html.contains("XID 79"));
        assert!(html.contains("all assertions passed"));
    }
}
