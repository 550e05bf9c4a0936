//! `dnx-fmt`: a standalone CLI around [`dnx_fmt::disassemble`] for inspecting
//! a compiled `.dnx` binary image without embedding it in a host.

use std::path::PathBuf;

use clap::Parser;

/// Disassemble a dnx binary image.
#[derive(Parser, Debug)]
#[command(name = "dnx-fmt", about = "Disassemble a dnx binary image", long_about = None)]
struct Args {
    /// Path to a compiled `.dnx` binary image.
    path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("could not parse {path} as a dnx binary image: {source}")]
    Parse { path: PathBuf, #[source] source: dnx_core::LoadError },
}

fn run(args: Args) -> Result<(), CliError> {
    let bytes = std::fs::read(&args.path).map_err(|source| CliError::Read { path: args.path.clone(), source })?;
    let image = dnx_core::image::parse(&bytes).map_err(|source| CliError::Parse { path: args.path.clone(), source })?;
    print!("{}", dnx_fmt::disassemble(&image));
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
