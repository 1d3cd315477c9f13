// Suspend the debuggee and dump every thread's stack with locals
//
// Run: cargo run --example inspect_stack -- 127.0.0.1:55555

use sdb_client::{ConnectionConfig, Value, VirtualMachine};
use tracing_subscriber::EnvFilter;

async fn render(value: &Value) -> anyhow::Result<String> {
    Ok(match value {
        Value::String(s) => format!("{:?}", s.string_value().await?),
        Value::Array(arr) => format!("array[{}]", arr.array_length().await?.element_count()),
        other => other.to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sdb_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:55555".to_string());
    let vm = VirtualMachine::connect(addr.as_str(), &ConnectionConfig::default()).await?;

    vm.suspend().await?;

    for thread in vm.all_threads().await? {
        println!("Thread {:x} ({})", thread.id(), thread.name().await?);

        for (depth, frame) in thread.frames().await?.iter().enumerate() {
            let ty = frame.method.declaring_type().await?;
            println!(
                "  #{} {}.{} IL_{:04x}",
                depth,
                ty.full_name().await?,
                frame.method.name().await?,
                frame.il_offset
            );

            let locals = frame.method.locals().await?;
            let positions: Vec<i32> = locals.iter().map(|l| l.index).collect();
            let values = frame.values(&positions).await?;
            for (local, value) in locals.iter().zip(&values) {
                println!("      {} = {}", local.name, render(value).await?);
            }
        }
    }

    vm.resume().await?;
    vm.disconnect().await;
    Ok(())
}
