//! Average two integers in the sink domain and print the result.
//!
//! Run with `RUST_LOG=debug` to see the runtime's tracing output.

use lib_dispatch::lib_types::{RuntimeConfig, StreamId};
use lib_dispatch::{sink_fn, InvocationRequest};

sink_fn! {
    fn average(args, ret) {
        let a = args.get(0).as_u64() as f64;
        let b = args.get(1).as_u64() as f64;
        let _ = ret.put_f64((a + b) / 2.0);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = lib_dispatch::global();
    runtime.register_function("average", average)?;
    lib_dispatch::initialize(&RuntimeConfig::single_device(1))?;

    let output = runtime
        .invoke(
            InvocationRequest::new(StreamId::new(0, 0), "average")
                .arg(4u64)
                .arg(8u64)
                .result_capacity(8),
        )?
        .wait()?;

    if let Some(value) = output.blob.as_ref().and_then(|b| b.read_f64(0)) {
        println!("average(4, 8) = {}", value);
    }

    lib_dispatch::finalize()?;
    Ok(())
}
