use anyhow::Result;
use clap::Parser;
use cli::{repl, Driver, DriverConfig};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Command file to run; starts the REPL when omitted
    #[arg(required = false)]
    file: Option<PathBuf>,

    /// Configuration file (defaults to ./declare.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Check `qed` proofs on a worker thread and register them at `(join)`
    #[arg(long)]
    async_proofs: bool,

    /// Register solved obligations as transparent definitions
    #[arg(long)]
    transparent_obligations: bool,

    /// Declare universe-polymorphic constants
    #[arg(long)]
    polymorphic: bool,
}

impl Cli {
    /// File settings, then the environment, then flags.
    fn driver_config(&self) -> Result<DriverConfig> {
        let mut config = DriverConfig::load(self.config.as_deref())?;
        config.apply_env()?;
        config.async_proofs |= self.async_proofs;
        config.transparent_obligations |= self.transparent_obligations;
        config.polymorphic |= self.polymorphic;
        Ok(config)
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.driver_config()?;
    tracing::debug!(?config, "driver configuration");
    let mut driver = Driver::new(config)?;
    match &cli.file {
        Some(path) => {
            let mut lines = driver.run_file(path)?;
            lines.extend(driver.finish()?);
            for line in lines {
                println!("{}", line);
            }
            Ok(())
        }
        None => repl::start(&mut driver),
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).without_time())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
