// List the assemblies loaded in the root domain as JSON
//
// Run: cargo run --example list_assemblies -- 127.0.0.1:55555

use sdb_client::{ConnectionConfig, VirtualMachine};
use serde_json::json;
use tracing_subscriber::EnvFilter;

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

    let domain = vm.root_domain().await?;
    let entry = domain.entry_assembly().await?;

    let mut assemblies = Vec::new();
    for assembly in domain.assemblies().await? {
        assemblies.push(json!({
            "id": assembly.id(),
            "name": assembly.name().await?,
            "location": assembly.location().await?,
            "entry": entry.as_ref() == Some(&assembly),
        }));
    }

    let report = json!({
        "domain": domain.friendly_name().await?,
        "protocol": vm.protocol_version(),
        "assemblies": assemblies,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    vm.disconnect().await;
    Ok(())
}
