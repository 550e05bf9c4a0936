//! `dnx-cli`: a sample console host for the dnx dialogue VM (§1, §6).
//!
//! This is a worked example of the suspension protocol, not a product: it
//! loads a binary image, runs a scene, and on each host tick calls
//! [`dnx::Vm::update`], printing dialogue lines and prompting for a choice
//! index whenever the VM suspends. It exists so host authors have something
//! to read before wiring their own render loop against the VM.

use std::io::Write as _;
use std::path::PathBuf;

use clap::Parser;
use dnx::{BinaryImage, EngineError, MapRegistry, Vm};

/// Run a dnx dialogue scene from the console.
#[derive(Parser, Debug)]
#[command(name = "dnx-cli", about = "Sample console host for the dnx dialogue VM", long_about = None)]
struct Args {
    /// Path to a compiled `.dnx` binary image.
    image: PathBuf,

    /// Scene to run.
    #[arg(long, default_value = "main")]
    scene: String,

    /// Path to a line-oriented translation file (§4.9); required unless the
    /// image embeds its own translation table.
    #[arg(long)]
    translations: Option<PathBuf>,

    /// Print the disassembled image instead of running it.
    #[arg(long)]
    disasm: bool,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("VM run failed: {0}")]
    Vm(#[from] dnx::Fault),
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

fn load_image(args: &Args) -> Result<BinaryImage, CliError> {
    let mut image = dnx::load_from_path(&args.image)?;
    if let Some(path) = &args.translations {
        let text = std::fs::read_to_string(path).map_err(|source| CliError::Read { path: path.clone(), source })?;
        let entries = dnx_core::translation::parse(&text);
        image.set_translation_table(entries);
    }
    Ok(image)
}

/// Prints the current dialogue line or choice list and, for a pending choice,
/// reads the player's pick from stdin. This is the entire host-side contract
/// the suspension protocol asks of a console host.
fn pump(vm: &mut Vm) -> Result<(), CliError> {
    if vm.running_text() {
        println!("{}", vm.current_text());
        vm.resume();
        return Ok(());
    }
    if vm.select_choice() {
        for (i, choice) in vm.choices().iter().enumerate() {
            println!("  [{i}] {}", choice.text);
        }
        loop {
            print!("> ");
            std::io::stdout().flush().ok();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
                std::process::exit(0);
            }
            match line.trim().parse::<usize>() {
                Ok(index) if index < vm.choices().len() => {
                    vm.choose_choice(index)?;
                    return Ok(());
                }
                _ => println!("enter a number between 0 and {}", vm.choices().len().saturating_sub(1)),
            }
        }
    }
    Ok(())
}

fn run(args: Args) -> Result<(), CliError> {
    let image = load_image(&args)?;

    if args.disasm {
        #[cfg(feature = "disasm")]
        {
            print!("{}", dnx::fmt::disassemble(&image));
            return Ok(());
        }
        #[cfg(not(feature = "disasm"))]
        {
            eprintln!("dnx-cli was built without the `disasm` feature");
            return Ok(());
        }
    }

    let mut vm = Vm::new(image, Box::new(MapRegistry::new()));
    vm.run_scene(&args.scene)?;

    while !vm.scene_completed() {
        pump(&mut vm)?;
        while !vm.paused() {
            vm.update()?;
        }
    }

    Ok(())
}

fn main() {
    init_tracing();
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
