#[tokio::main]
async fn main() {
    relay_server::app::run().await;
}
