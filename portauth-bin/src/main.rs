use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    portauth_bin::run().await
}
