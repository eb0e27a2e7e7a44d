use anyhow::{anyhow, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::LevelFilter;
use prinbee_core::context::{decode_context_info_bytes, file_magic};
use prinbee_types::Magic;
use std::fs;
use std::path::PathBuf;

trait CliCommand {
    fn run(&self) -> Result<()>;
}

#[derive(Args)]
struct FileSource {
    /// Path to a context.pb, complex-types.pb, schema or table file.
    path: PathBuf,
}

impl FileSource {
    fn read(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|e| anyhow!("reading {:?}: {e}", self.path))
    }
}

#[derive(Parser)]
struct Dump {
    #[command(flatten)]
    source: FileSource,
}

impl CliCommand for Dump {
    fn run(&self) -> Result<()> {
        let bytes = self.source.read()?;
        let magic = file_magic(&bytes)?;
        println!("file: {:?}", self.source.path);
        println!("magic: {magic} ({} bytes)", bytes.len());

        match magic {
            Magic::Context => {
                let info = decode_context_info_bytes(&bytes)?;
                println!("kind: context");
                println!("id: {:?}", info.id);
                println!("schema_version: {}", info.schema_version);
                println!("created_on: {:?}", info.created_on);
                println!("last_updated_on: {:?}", info.last_updated_on);
            }
            Magic::ComplexType => {
                println!("kind: complex type registry");
            }
            Magic::Unknown => {
                return Err(anyhow!("{:?} does not start with a recognized Prinbee magic", self.source.path));
            }
            other => {
                println!("kind: {other} (field-level dump not yet implemented for this file kind)");
            }
        }

        Ok(())
    }
}

#[derive(Parser)]
struct DumpMagic {
    #[command(flatten)]
    source: FileSource,
}

impl CliCommand for DumpMagic {
    fn run(&self) -> Result<()> {
        let bytes = self.source.read()?;
        let magic = file_magic(&bytes)?;
        println!("{magic}");
        Ok(())
    }
}

#[derive(Subcommand)]
enum Subcommands {
    /// Print a file's magic, structure kind, and decoded fields where known.
    Dump(Dump),
    /// Print only a file's 4-character magic.
    DumpMagic(DumpMagic),
}

impl Subcommands {
    fn as_cli_command(&self) -> &dyn CliCommand {
        match self {
            Self::Dump(c) => c,
            Self::DumpMagic(c) => c,
        }
    }
}

#[derive(Parser)]
struct Cli {
    /// Increase logging verbosity. Can be specified multiple times.
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Subcommands,
}

impl Cli {
    fn run() -> Result<()> {
        let cli = Self::parse();

        let log_level = match cli.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level.as_str())).init();

        cli.command.as_cli_command().run()
    }
}

fn main() {
    let exit_code = match Cli::run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    };

    std::process::exit(exit_code)
}
