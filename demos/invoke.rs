// Call ToString() on `this` of the top frame of a suspended thread
//
// Run: cargo run --example invoke -- 127.0.0.1:55555

use anyhow::Context;
use sdb_client::{ConnectionConfig, InvokeOptions, InvokeOutcome, Value, VirtualMachine};
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
    vm.suspend().await?;

    let thread = vm.all_threads().await?.into_iter().next().context("no threads")?;
    let frame = thread.frames().await?.into_iter().next().context("thread has no frames")?;
    let this = frame.this_value().await?;
    let object = this.as_object().context("top frame has no `this`")?;

    let object_type = object.object_type().await?;
    let corlib = vm.root_domain().await?.corlib().await?;
    let system_object = corlib
        .get_type("System.Object", false)
        .await?
        .context("System.Object not found")?;

    let mut to_string = None;
    for method in system_object.methods().await? {
        if method.name().await? == "ToString" {
            to_string = Some(method);
            break;
        }
    }
    let to_string = to_string.context("System.Object.ToString not found")?;

    let options = InvokeOptions {
        virtual_call: true,
        single_threaded: true,
        ..Default::default()
    };
    println!("Invoking ToString() on a {}", object_type.full_name().await?);

    match vm.invoke_method(&thread, &to_string, Some(&this), &[], options).await? {
        InvokeOutcome::Returned(result) => match &result.value {
            Value::String(s) => println!("✓ {}", s.string_value().await?),
            other => println!("✓ {}", other),
        },
        InvokeOutcome::Thrown(thrown) => {
            let exc_type = match thrown.exception.as_object() {
                Some(exc) => exc.object_type().await?.full_name().await?,
                None => "<null>".to_string(),
            };
            println!("✗ ToString() threw {}", exc_type);
        }
    }

    vm.resume().await?;
    vm.disconnect().await;
    Ok(())
}
