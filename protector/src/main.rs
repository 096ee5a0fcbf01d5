use std::{fs, path::PathBuf};

use clap::Parser;
use exe::{Buffer, VecPE};
use logger::info;
use protector::virt::bytecode::BytecodeVirtualizer;

#[derive(Parser)]
#[command(author, version)]
struct Args {
    input: PathBuf,

    /// Interpreter DLL carrying the VM entry code.
    #[arg(short = 'i', long = "interpreter", default_value = "Interpreter.dll")]
    interpreter: PathBuf,

    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    if args.debug {
        logger::set_level(logger::LogLevel::Debug);
    }

    let input = &args.input;

    let pe = VecPE::from_disk_file(input).unwrap();
    let interpreter = VecPE::from_disk_file(&args.interpreter).unwrap();

    let protected = protector::protect(pe, interpreter, &BytecodeVirtualizer).unwrap();

    let output = if let Some(extension) = input.extension() {
        input.with_extension("").with_file_name(format!(
            "{}.protected.{}",
            input.file_stem().unwrap().to_str().unwrap(),
            extension.to_str().unwrap()
        ))
    } else {
        let mut output = input.to_path_buf();
        output.set_file_name(format!(
            "{}.protected",
            input.file_name().unwrap().to_str().unwrap()
        ));
        output
    };

    fs::write(&output, protected.to_vec()).unwrap();

    info!("Wrote output to '{}'", output.display());
}
