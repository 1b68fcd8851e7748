use std::{error::Error, net::SocketAddr, sync::Arc};

use clap::Parser;
use floe::protocol::{MemoryDataset, ResultServer};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connection at address
    address: SocketAddr,
    /// Rows in the generated `numbers` table
    #[arg(long, default_value_t = 1000)]
    rows: u64,
    /// Connections served concurrently
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let dataset = MemoryDataset::new().with_table("numbers", MemoryDataset::series(cli.rows));
    let server = ResultServer::new(cli.address, Arc::new(dataset), cli.workers)?;

    server.listen()?;
    Ok(())
}
