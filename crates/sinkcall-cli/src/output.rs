//! Report formatting.

use crate::runner::InvokeReport;
use crate::OutputFormat;
use anyhow::Result;
use std::io::Write;

/// Write an invocation report to `out`.
pub fn write_report<W: Write>(out: &mut W, report: &InvokeReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            writeln!(out, "Function:    {}", report.function)?;
            writeln!(out, "Stream:      {}", report.stream)?;
            writeln!(out, "Arguments:   {}", report.arg_count)?;
            writeln!(out, "Result size: {} bytes", report.result_size)?;
            if report.calls > 1 {
                writeln!(out, "Calls:       {}", report.calls)?;
            }
            writeln!(out, "Latency:     {:.1} us", report.mean_latency_us)?;
            for (i, field) in report.fields.iter().enumerate() {
                writeln!(out, "  [{}] {}", i, field)?;
            }
            if report.fields.is_empty() && !report.raw.is_empty() {
                writeln!(out, "  raw: {}", hex(&report.raw))?;
            }
        }
        OutputFormat::Json => {
            writeln!(out, "{}", serde_json::to_string_pretty(report)?)?;
        }
        OutputFormat::Csv => {
            writeln!(out, "index,value")?;
            for (i, field) in report.fields.iter().enumerate() {
                writeln!(out, "{},{}", i, field)?;
            }
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
