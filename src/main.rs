use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use jasper::{init_argv, EvalResult, VM};

#[derive(Parser)]
#[command(name = "jasper", version, about = "The Jasper language interpreter")]
struct Cli {
    /// Script file to run as __main__
    script: Option<PathBuf>,

    /// Arguments exposed to the script as sys.args
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Evaluate an inline source string instead of a file
    #[arg(short = 'e', long = "eval", conflicts_with = "script")]
    eval: Option<String>,

    /// Add a directory to the module search path (repeatable)
    #[arg(short = 'L', long = "lib-path")]
    lib_paths: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut vm = VM::new();
    for path in &cli.lib_paths {
        vm.add_import_path(&path.to_string_lossy());
    }
    init_argv(&cli.args);

    let result = if let Some(source) = &cli.eval {
        vm.evaluate(source, "<eval>")
    } else if let Some(script) = &cli.script {
        // Modules import relative to the script's directory first.
        if let Some(dir) = script.parent() {
            if !dir.as_os_str().is_empty() {
                vm.add_import_path(&dir.to_string_lossy());
            }
        }
        match std::fs::read_to_string(script) {
            Ok(source) => vm.evaluate(&source, &script.to_string_lossy()),
            Err(error) => {
                eprintln!("jasper: cannot read {}: {}", script.display(), error);
                return ExitCode::from(66); // EX_NOINPUT
            }
        }
    } else {
        eprintln!("jasper: no script given (try --help)");
        return ExitCode::from(64); // EX_USAGE
    };

    match result {
        EvalResult::Success => ExitCode::SUCCESS,
        EvalResult::SyntaxErr | EvalResult::CompileErr => ExitCode::from(65), // EX_DATAERR
        EvalResult::RuntimeErr => ExitCode::from(70),                         // EX_SOFTWARE
    }
}
