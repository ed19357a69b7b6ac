use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clinic_relay_lib::RunOptions;

/// Real-time clinician/patient transcription and translation relay
#[derive(Debug, Parser)]
#[command(name = "clinic-relay", version, about)]
struct Cli {
    /// Settings file (default: ~/.clinic-relay/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:8787
    #[arg(long)]
    bind: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to stderr only
    #[arg(long)]
    no_file_log: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let options = RunOptions {
        config_path: cli.config,
        bind_address: cli.bind,
        log_level: cli.log_level,
        file_logging: !cli.no_file_log,
    };

    match clinic_relay_lib::run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("clinic-relay: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["clinic-relay"]).unwrap();
        assert_eq!(cli.log_level, "info");
        assert!(cli.config.is_none());
        assert!(!cli.no_file_log);
    }

    #[test]
    fn test_flags() {
        let cli = Cli::try_parse_from([
            "clinic-relay",
            "--config",
            "/tmp/relay.json",
            "--bind",
            "127.0.0.1:9000",
            "--no-file-log",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/relay.json")));
        assert_eq!(cli.bind.as_deref(), Some("127.0.0.1:9000"));
        assert!(cli.no_file_log);
    }
}
