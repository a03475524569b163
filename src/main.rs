use clap::Parser;
use sqlite_gateway::{ServerArgs, run_server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
   tracing_subscriber::fmt()
      .with_env_filter(
         EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
      )
      .init();

   run_server(ServerArgs::parse()).await
}
