use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use vcfshark_lib::archive::Archive;
use vcfshark_lib::CompressedFile;

#[derive(Parser)]
#[command(name = "vcfshark")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect VCFShark archives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print archive attributes and the declared keys
    Info(InfoArgs),
    /// List every stream with part counts and stored sizes
    Streams(InfoArgs),
}

#[derive(Parser)]
struct InfoArgs {
    /// Archive file
    #[arg(short, long, value_name = "FILE", required = true)]
    input: PathBuf,
}

fn info(args: &InfoArgs) -> Result<()> {
    let file = CompressedFile::open_for_reading(&args.input)?;
    println!("variants:      {}", file.no_variants()?);
    println!("samples:       {}", file.no_samples()?);
    println!("ploidy:        {}", file.ploidy()?);
    println!("neglect limit: {}", file.params()?.neglect_limit);
    let keys = file.get_keys()?;
    println!("keys:          {}", keys.len());
    for key in keys {
        println!(
            "  [{:>3}] {:<16} {:?}{}",
            key.id,
            String::from_utf8_lossy(&key.name),
            key.kind,
            if key.neglect { "  (neglect)" } else { "" },
        );
    }
    Ok(())
}

fn streams(args: &InfoArgs) -> Result<()> {
    let archive = Archive::open(&args.input)?;
    println!("{:<24} {:>6} {:>12}  link", "stream", "parts", "bytes");
    for (name, link, parts, bytes) in archive.list_streams() {
        println!(
            "{name:<24} {parts:>6} {bytes:>12}  {}",
            link.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Info(args) => info(&args),
        Commands::Streams(args) => streams(&args),
    }
}
