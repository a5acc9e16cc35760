use clap::Parser as ClapParser;
use std::path::PathBuf;
use std::process;

use malang_bytecode::BytecodeDecoder;
use malang_heap::GcConfig;
use malang_vm::{compile, image, interpreter, Program, Vm};
use tracing_subscriber::EnvFilter;

#[derive(ClapParser, Debug)]
#[command(author, version, about = "The Malang runtime", long_about = None)]
struct Cli {
    /// Source file to execute
    file: Option<PathBuf>,

    /// Print the compiled bytecode and constants instead of running
    #[arg(long)]
    emit_bytecode: bool,

    /// Write the compiled image to this path instead of running
    #[arg(long, value_name = "PATH")]
    save_image: Option<PathBuf>,

    /// Run a previously saved image
    #[arg(long, value_name = "PATH", conflicts_with = "file")]
    run_image: Option<PathBuf>,

    /// Automatic-GC threshold floor in bytes
    #[arg(long, value_name = "BYTES")]
    gc_threshold: Option<usize>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let program = match load_program(&cli) {
        Ok(program) => program,
        Err(message) => {
            eprintln!("{message}");
            process::exit(1);
        }
    };

    if cli.emit_bytecode {
        disassemble(&program);
        return;
    }

    if let Some(path) = &cli.save_image {
        if let Err(err) = image::save(&program, path) {
            eprintln!("error writing image: {err}");
            process::exit(1);
        }
        return;
    }

    let mut gc_config = GcConfig::default();
    if let Some(threshold) = cli.gc_threshold {
        gc_config.min_threshold = threshold;
    }
    let mut vm =
        Vm::with_gc_config(program, Box::new(std::io::stdout()), gc_config);
    if let Err(trap) = interpreter::run(&mut vm) {
        eprint!("{trap}");
        process::exit(1);
    }
}

fn load_program(cli: &Cli) -> Result<Program, String> {
    if let Some(path) = &cli.run_image {
        return image::load(path).map_err(|err| err.to_string());
    }
    let Some(path) = &cli.file else {
        return Err("usage: malang <file.ma> (or --run-image <path>)".to_string());
    };
    let source = std::fs::read_to_string(path)
        .map_err(|err| format!("error reading {}: {err}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    compile(&source, &name).map_err(|err| err.to_string())
}

fn disassemble(program: &Program) {
    println!("; entry: function #{}", program.entry.0);
    println!("; constants:");
    for (index, constant) in program.constants.iter().enumerate() {
        println!(";   #{index}: {constant:?}");
    }
    println!("; functions:");
    for (index, function) in program.functions.iter().enumerate() {
        println!(
            ";   #{index}: {} ({} params) -> {}",
            function.name,
            function.arity(),
            program.types.get(function.ret).name
        );
    }
    let mut decoder = BytecodeDecoder::new(&program.code);
    loop {
        let offset = decoder.offset();
        let Some(instr) = decoder.decode_next() else {
            break;
        };
        println!("{offset:6}  {instr}");
    }
}
