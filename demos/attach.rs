// Attach to an agent and print what it reports about itself
//
// Start the debuggee with
//   mono --debugger-agent=transport=dt_socket,address=127.0.0.1:55555,server=y app.exe
// then run: cargo run --example attach -- 127.0.0.1:55555

use sdb_client::{ConnectionConfig, VirtualMachine};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sdb_client=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:55555".to_string());

    let vm = VirtualMachine::connect(addr.as_str(), &ConnectionConfig::default()).await?;
    println!("✓ Attached to {}", addr);

    let version = vm.version().await?;
    println!("Runtime:    {}", version.description);
    println!("Agent:      {}", version.protocol());
    println!("Negotiated: {}", vm.protocol_version());

    let threads = vm.all_threads().await?;
    println!("\n{} thread(s):", threads.len());
    for thread in &threads {
        let name = thread.name().await?;
        let state = thread.state().await?;
        println!("  {:>6x}  state={:#06x}  {}", thread.id(), state, name);
    }

    vm.disconnect().await;
    Ok(())
}
