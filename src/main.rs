use std::env;
use std::io::{self, Write};

use anyhow::{Context, Result};

use lazypatch::{LinkerConfig, prepare_demo};

struct Cli {
    debug: bool,
}

impl Cli {
    fn parse() -> Self {
        let mut debug = false;

        for arg in env::args().skip(1) {
            match arg.as_str() {
                "--debug" => debug = true,
                "-h" | "--help" => {
                    println!("Call a stub that patches its own call site on first use");
                    println!("Usage: lazypatch [OPTIONS]");
                    println!("Options:");
                    println!(
                        "  --debug      Put an int3 in front of the stub (run under a debugger)"
                    );
                    println!("  -h, --help   Print help information");
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown option: {}", arg);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
        }

        Self { debug }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = LinkerConfig {
        diagnostics: cli.debug,
    };

    let prepared = prepare_demo(config).context("Failed to link the demonstration call")?;
    // the first call may stop at the trap marker, so the dumps go out first
    for line in &prepared.dumps {
        println!("{}", line);
    }
    io::stdout().flush()?;

    let report = prepared.run().context("Lazy call demonstration failed")?;
    for line in report.render() {
        println!("{}", line);
    }

    Ok(())
}
