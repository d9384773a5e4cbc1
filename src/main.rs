use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use ppcjit::config::JitConfig;
#[cfg(feature = "jit")]
use ppcjit::jit::aarch64::{Arm64Emitter, LogicalImm, Reg, plan_movi2r};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum FormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "ppcjit")]
#[command(about = "PowerPC to AArch64 recompiler core tools", long_about = None)]
struct Cli {
    /// Output format (human or json)
    #[arg(long, value_enum, default_value = "human", global = true)]
    format: FormatArg,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// JIT configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the instructions chosen to materialise an immediate
    Movi2r {
        /// Value, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_u64)]
        value: u64,

        /// Target a 32-bit W register
        #[arg(long)]
        w: bool,
    },
    /// Classify a value as a logical (bitmask) immediate
    LogicalImm {
        /// Value, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_u64)]
        value: u64,

        /// Classify as a 32-bit immediate
        #[arg(long)]
        w: bool,
    },
    /// Print the resolved JIT configuration
    Config {
        /// Configuration file (overrides --config)
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => match s.strip_prefix('-') {
            Some(neg) => neg.parse::<u64>().map(|v| v.wrapping_neg()),
            None => s.parse::<u64>(),
        },
    };
    parsed.map_err(|e| format!("invalid value '{}': {}", s, e))
}

fn init_logging(verbose: u8, configured: &str) {
    let level = match verbose {
        0 => configured.to_ascii_lowercase(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = match level.as_str() {
        "off" => tracing_subscriber::filter::LevelFilter::OFF,
        "error" => tracing_subscriber::filter::LevelFilter::ERROR,
        "info" => tracing_subscriber::filter::LevelFilter::INFO,
        "debug" => tracing_subscriber::filter::LevelFilter::DEBUG,
        "trace" => tracing_subscriber::filter::LevelFilter::TRACE,
        _ => tracing_subscriber::filter::LevelFilter::WARN,
    };
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Serialize)]
struct Movi2rReport {
    value: u64,
    width: u32,
    approach: String,
    words: Vec<String>,
}

#[derive(Serialize)]
struct LogicalImmReport {
    value: u64,
    width: u32,
    encodable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    immr: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    imms: Option<u8>,
}

fn print_report<T: Serialize>(format: FormatArg, report: &T, human: impl FnOnce(&T)) -> Result<(), String> {
    match format {
        FormatArg::Human => {
            human(report);
            Ok(())
        }
        FormatArg::Json => {
            let text = serde_json::to_string_pretty(report).map_err(|e| e.to_string())?;
            println!("{}", text);
            Ok(())
        }
    }
}

#[cfg(feature = "jit")]
fn movi2r(value: u64, w: bool, format: FormatArg) -> Result<(), String> {
    let mut emit = Arm64Emitter::with_capacity(64);
    let start = emit.code_ptr();
    let plan = plan_movi2r(value, !w, start);
    emit.movi2r(if w { Reg::W0 } else { Reg::X0 }, value);
    let end = emit.code_ptr();

    let report = Movi2rReport {
        value: if w { value & 0xFFFF_FFFF } else { value },
        width: if w { 32 } else { 64 },
        approach: format!("{:?}", plan.approach),
        words: emit.buffer().words(start, end).iter().map(|word| format!("{:#010x}", word)).collect(),
    };
    print_report(format, &report, |r| {
        println!("{:#x} ({}-bit) via {}", r.value, r.width, r.approach);
        for word in &r.words {
            println!("  {}", word);
        }
    })
}

#[cfg(feature = "jit")]
fn logical_imm(value: u64, w: bool, format: FormatArg) -> Result<(), String> {
    let width = if w { 32 } else { 64 };
    let imm = LogicalImm::new(value, width);
    let report = LogicalImmReport {
        value: if w { value & 0xFFFF_FFFF } else { value },
        width,
        encodable: imm.valid,
        n: imm.valid.then_some(imm.n as u8),
        immr: imm.valid.then_some(imm.r),
        imms: imm.valid.then_some(imm.s),
    };
    print_report(format, &report, |r| match (r.n, r.immr, r.imms) {
        (Some(n), Some(immr), Some(imms)) => println!("n={} immr={} imms={}", n, immr, imms),
        _ => println!("{:#x} is not encodable as a {}-bit logical immediate", r.value, r.width),
    })
}

#[cfg(not(feature = "jit"))]
fn movi2r(_: u64, _: bool, _: FormatArg) -> Result<(), String> {
    Err("built without the jit feature".to_string())
}

#[cfg(not(feature = "jit"))]
fn logical_imm(_: u64, _: bool, _: FormatArg) -> Result<(), String> {
    Err("built without the jit feature".to_string())
}

fn show_config(config: &JitConfig, format: FormatArg) -> Result<(), String> {
    match format {
        FormatArg::Human => {
            let text = config.to_toml_string().map_err(|e| e.to_string())?;
            print!("{}", text);
            Ok(())
        }
        FormatArg::Json => print_report(format, config, |_| {}),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Config { file: Some(file) } => Some(file.clone()),
        _ => cli.config.clone(),
    };
    let config = match config_path {
        Some(path) => match JitConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => JitConfig::default(),
    };
    init_logging(cli.verbose, &config.log_level);

    let result = match cli.command {
        Commands::Movi2r { value, w } => movi2r(value, w, cli.format),
        Commands::LogicalImm { value, w } => logical_imm(value, w, cli.format),
        Commands::Config { .. } => show_config(&config, cli.format),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u64_forms() {
        assert_eq!(parse_u64("0x1234_5678"), Ok(0x1234_5678));
        assert_eq!(parse_u64("42"), Ok(42));
        assert_eq!(parse_u64("-1"), Ok(u64::MAX));
        assert!(parse_u64("0xZZ").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["ppcjit", "--format", "json", "movi2r", "0xFFFF0000", "--w"]).unwrap();
        assert_eq!(cli.format, FormatArg::Json);
        assert!(matches!(cli.command, Commands::Movi2r { value: 0xFFFF_0000, w: true }));

        let cli = Cli::try_parse_from(["ppcjit", "-vv", "config"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Config { file: None }));
    }
}
