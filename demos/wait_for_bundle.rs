use std::time::Duration;

use sling_it_client::{osgi::OsgiConsoleClient, SlingClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let bundle = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "org.apache.sling.api".to_owned());
    let client = SlingClient::from_env()?;
    let osgi = OsgiConsoleClient::new(client);

    osgi.wait_bundle_started(&bundle, Duration::from_secs(60), Duration::from_millis(500))
        .await?;
    let info = osgi.bundle(&bundle).await?;
    println!(
        "{} {} is {:?}",
        bundle,
        info.version.as_deref().unwrap_or("?"),
        info.status()
    );

    Ok(())
}
