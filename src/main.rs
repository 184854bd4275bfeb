#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nexus_stock_lib::run().await
}
