//! Drives a runtime through one CLI invocation.

use crate::args::{self, Decoded, FieldKind};
use anyhow::{Context, Result};
use lib_dispatch::{ArgList, InvocationRequest, Runtime};
use lib_types::{RuntimeConfig, StreamId};
use serde::Serialize;
use std::time::{Duration, Instant};

/// What to invoke and how to read the result.
#[derive(Clone, Debug)]
pub struct InvokePlan {
    pub function: String,
    pub stream: StreamId,
    pub args: ArgList,
    pub layout: Vec<FieldKind>,
    /// Result capacity; defaults to the size of `layout`.
    pub result_size: Option<u16>,
    pub repeat: u32,
    pub timeout: Duration,
}

/// Outcome of a CLI invocation.
#[derive(Clone, Debug, Serialize)]
pub struct InvokeReport {
    pub function: String,
    pub stream: String,
    pub arg_count: usize,
    pub result_size: u16,
    pub calls: u32,
    pub mean_latency_us: f64,
    pub fields: Vec<Decoded>,
    pub raw: Vec<u8>,
}

/// Owns a runtime for the duration of a CLI command.
pub struct Invoker {
    runtime: Runtime,
}

impl Invoker {
    /// Bring a runtime up from `config`.
    pub fn start(config: &RuntimeConfig) -> Result<Self> {
        let runtime = Runtime::new();
        runtime
            .initialize(config)
            .context("Failed to initialize runtime")?;
        Ok(Self { runtime })
    }

    /// Run the plan and decode the last result.
    pub fn run(&self, plan: &InvokePlan) -> Result<InvokeReport> {
        let result_size = match plan.result_size {
            Some(size) => size,
            None => u16::try_from(args::layout_size(&plan.layout))
                .context("Result layout is larger than any blob capacity")?,
        };
        let repeat = plan.repeat.max(1);

        tracing::info!(
            function = %plan.function,
            stream = %plan.stream,
            args = plan.args.len(),
            result_size,
            repeat,
            "Invoking sink function"
        );

        let started = Instant::now();
        let mut last = None;
        for _ in 0..repeat {
            let mut request = InvocationRequest::new(plan.stream, plan.function.clone())
                .args(plan.args.clone());
            if result_size > 0 {
                request = request.result_capacity(result_size);
            }
            let completion = self.runtime.invoke(request)?;
            last = Some(completion.wait_timeout(plan.timeout)?);
        }
        let elapsed = started.elapsed();

        let output = last.context("No invocation ran")?;
        let (fields, raw) = match &output.blob {
            Some(blob) => (args::decode(blob, &plan.layout)?, blob.as_bytes().to_vec()),
            None => (Vec::new(), Vec::new()),
        };

        Ok(InvokeReport {
            function: plan.function.clone(),
            stream: plan.stream.to_string(),
            arg_count: plan.args.len(),
            result_size,
            calls: repeat,
            mean_latency_us: elapsed.as_secs_f64() * 1e6 / f64::from(repeat),
            fields,
            raw,
        })
    }

    /// Tear the runtime down.
    pub fn finish(self) -> Result<()> {
        self.runtime
            .finalize()
            .context("Failed to finalize runtime")?;
        Ok(())
    }
}

/// Parse `device/stream` or a bare stream index on device 0.
pub fn parse_stream(text: &str) -> Result<StreamId> {
    let (device, index) = match text.split_once('/') {
        Some((device, index)) => (device, index),
        None => ("0", text),
    };
    let device = device
        .trim_start_matches("device")
        .parse()
        .with_context(|| format!("Invalid device in stream '{}'", text))?;
    let index = index
        .trim_start_matches("stream")
        .parse()
        .with_context(|| format!("Invalid stream index in '{}'", text))?;
    Ok(StreamId::new(device, index))
}
