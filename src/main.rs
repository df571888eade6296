#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bugtrail::cli::run().await
}
