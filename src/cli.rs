use std::path::PathBuf;

use clap::Parser;

/// The C99-to-JavaScript transpiler
#[derive(Parser)]
#[command(name = "c99js")]
#[command(version)]
#[command(about = "Translate a C99 source file into a self-contained JavaScript program", long_about = None)]
pub struct Cli {
    /// Output file (default: standard output)
    #[arg(short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Add include search path (may repeat)
    #[arg(short = 'I', value_name = "DIR")]
    pub include: Vec<PathBuf>,

    /// Define preprocessor macro (value defaults to 1)
    #[arg(short = 'D', value_name = "NAME[=VALUE]")]
    pub define: Vec<String>,

    /// Preprocess only; write preprocessed text to output
    #[arg(short = 'E')]
    pub preprocess_only: bool,

    /// Print the AST (reserved)
    #[arg(long = "dump-ast")]
    pub dump_ast: bool,

    /// Input file to compile
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,
}

impl Cli {
    /// Split `-D name[=value]` arguments; a bare name defaults to 1.
    pub fn macro_definitions(&self) -> Vec<(String, String)> {
        self.define
            .iter()
            .map(|d| match d.split_once('=') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => (d.clone(), "1".to_string()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_splits_name_and_value() {
        let cli = Cli::parse_from(["c99js", "-DFOO", "-DBAR=2", "in.c"]);
        assert_eq!(
            cli.macro_definitions(),
            vec![
                ("FOO".to_string(), "1".to_string()),
                ("BAR".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn include_paths_repeat() {
        let cli = Cli::parse_from(["c99js", "-I", "a", "-I", "b", "-o", "out.js", "in.c"]);
        assert_eq!(cli.include.len(), 2);
        assert_eq!(cli.output, Some(PathBuf::from("out.js")));
        assert_eq!(cli.input, PathBuf::from("in.c"));
    }

    #[test]
    fn preprocess_only_flag() {
        let cli = Cli::parse_from(["c99js", "-E", "in.c"]);
        assert!(cli.preprocess_only);
        assert!(!cli.dump_ast);
    }
}
