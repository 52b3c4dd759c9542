use sling_it_client::{indexing::IndexingClient, SlingClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let client = SlingClient::from_env()?;

    client
        .create_node_recursive("/tmp/demo/content", "sling:Folder")
        .await?;
    client
        .import_json(
            "/tmp/demo/content",
            &serde_json::json!({"page": {"jcr:primaryType": "nt:unstructured", "title": "Demo"}}),
        )
        .await?;

    IndexingClient::new(client.clone())
        .wait_for_async_indexing_default()
        .await?;

    let page = client.get("/tmp/demo/content/page.json", [200]).await?;
    println!("{}", page.content());

    client.delete_path("/tmp/demo").await?;
    Ok(())
}
