use std::env;
use std::fs;
use std::process::ExitCode;

use oba::{ObaError, Vm};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(file_path) = args.get(1) else {
        eprintln!("usage: oba <script>");
        return ExitCode::FAILURE;
    };

    let source = match read_file(file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut vm = Vm::new(&[]);
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error @ ObaError::Compile(_)) => {
            eprintln!("{error}");
            ExitCode::from(65)
        }
        Err(error @ ObaError::Runtime(_)) => {
            eprintln!("{error}");
            ExitCode::from(70)
        }
    }
}

fn read_file(file_path: &str) -> Result<String, String> {
    match fs::metadata(file_path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("{file_path} is not a file"));
            }
        }
        Err(err) => {
            return Err(format!("could not read {file_path}: {err}"));
        }
    }
    fs::read_to_string(file_path).map_err(|err| format!("could not read {file_path}: {err}"))
}
