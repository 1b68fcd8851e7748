use clap::Parser;
use std::{
    error::Error,
    io::{self, Write},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use floe::{ConnectionConfig, ResultConfig, ScrollMode, Scroller, Session};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    address: SocketAddr,
    /// Statement to run
    sql: String,
    /// Rows requested per page
    #[arg(long, default_value_t = 100)]
    fetch_size: u32,
    /// Stop after this many rows; 0 reads everything
    #[arg(long, default_value_t = 0)]
    max_rows: u64,
    /// Print the result from the last row backwards
    #[arg(long)]
    reverse: bool,
    #[arg(long, default_value = "")]
    user: String,
    #[arg(long, default_value = "")]
    password: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

    let session =
        Session::connect(ConnectionConfig::new(cli.address).credentials(&cli.user, &cli.password))?;
    let mode = if cli.reverse {
        ScrollMode::Scrollable
    } else {
        ScrollMode::Forward
    };
    let config = ResultConfig::default()
        .fetch_size(cli.fetch_size)
        .max_rows(cli.max_rows)
        .mode(mode);

    let mut result = session.query(&cli.sql, &config)?;
    let mut stdout = io::stdout().lock();
    let header: Vec<&str> = result.columns().iter().map(|c| c.name.as_str()).collect();
    writeln!(&mut stdout, "{}", header.join(" | "))?;

    let scroller = result.scroller();
    let mut on_row = if cli.reverse {
        scroller.last()?
    } else {
        scroller.next()?
    };
    let mut printed = 0u64;
    while on_row && !interrupted.load(Ordering::SeqCst) {
        if let Some(row) = scroller.current() {
            writeln!(&mut stdout, "{row}")?;
            printed += 1;
        }
        on_row = if cli.reverse {
            scroller.previous()?
        } else {
            scroller.next()?
        };
    }

    if interrupted.load(Ordering::SeqCst) {
        eprintln!("interrupted after {printed} rows");
    } else {
        eprintln!("{printed} rows");
    }

    if let Err(e) = result.close() {
        eprintln!("failed to close result. error: {e}");
    }
    session.close()?;
    Ok(())
}
