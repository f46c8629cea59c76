use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    ingest_cli::main_entry().await
}
