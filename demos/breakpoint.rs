// Set a breakpoint at the start of a method and report each hit
//
// Run: cargo run --example breakpoint -- 127.0.0.1:55555 App.Program Main

use anyhow::{anyhow, Context};
use sdb_client::{ConnectionConfig, EventDetails, SuspendPolicy, VirtualMachine};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sdb_client=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:55555".to_string());
    let type_name = args.next().unwrap_or_else(|| "App.Program".to_string());
    let method_name = args.next().unwrap_or_else(|| "Main".to_string());

    let vm = VirtualMachine::connect(addr.as_str(), &ConnectionConfig::default()).await?;
    println!("✓ Connected to {}", addr);

    let ty = vm
        .types(&type_name, false)
        .await?
        .into_iter()
        .next()
        .with_context(|| format!("type {} is not loaded", type_name))?;

    let mut target = None;
    for method in ty.methods().await? {
        if method.name().await? == method_name {
            target = Some(method);
            break;
        }
    }
    let method = target.ok_or_else(|| anyhow!("{} has no method {}", type_name, method_name))?;

    let request = vm.event_requests().create_breakpoint(&method, 0)?;
    request.set_suspend_policy(SuspendPolicy::EventThread)?;
    request.enable().await?;
    println!(
        "🎯 Breakpoint {} set on {}.{}",
        request.request_id().unwrap_or_default(),
        type_name,
        method_name
    );

    vm.resume().await?;
    println!("Waiting for hits (Ctrl+C to stop)...");

    loop {
        let events = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            events = vm.next_event() => events?,
        };

        for event in &events.events {
            if let EventDetails::Breakpoint { il_offset, .. } = &event.details {
                let thread = match &event.thread {
                    Some(thread) => thread.name().await?,
                    None => "<unknown>".to_string(),
                };
                println!("⏸  Hit at IL_{:04x} on thread {:?}", il_offset, thread);
            }
        }

        if events.suspend_policy != SuspendPolicy::None {
            vm.resume().await?;
        }
    }

    println!("\n🧹 Cleaning up...");
    request.delete().await?;
    vm.disconnect().await;
    Ok(())
}
