use anyhow::Result;
use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::{
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

fn init_logger() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn main() -> Result<()> {
    init_logger();
    let matches = mbport::cli::parse_args();

    match matches.subcommand() {
        Some(("print-config", sub)) => {
            let config = mbport::cli::resolve_config(sub)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Some(("serve", sub)) => {
            let config = mbport::cli::resolve_config(sub)?;
            let stop = Arc::new(AtomicBool::new(false));
            {
                let stop = stop.clone();
                ctrlc::set_handler(move || {
                    log::info!("Ctrl+C received, shutting down");
                    stop.store(true, Ordering::SeqCst);
                })?;
            }
            mbport::cli::serve(&config, stop)
        }
        _ => unreachable!("clap requires a subcommand"),
    }
}
