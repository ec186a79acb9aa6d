//! fswatch daemon entry point: loads settings, starts the monitor, and
//! serves the line-oriented operator shell on stdin.

use std::path::PathBuf;
use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fswatch_daemon::monitor::{CommandOutcome, Monitor};
use fswatch_daemon::observer::inotify_info;
use fswatch_daemon::settings::Settings;

const USAGE: &str = "usage: fswatch-daemon [--config_files <file>...] <path>...";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fswatch_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = match settings_from_args(std::env::args().skip(1)) {
        Ok(settings) => settings,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    match inotify_info() {
        Ok(limits) => info!("inotify limits: {limits:?}"),
        Err(err) => error!("cannot read inotify limits: {err}"),
    }

    let monitor = match Monitor::start(settings).await {
        Ok(monitor) => monitor,
        Err(err) => {
            error!("cannot start monitor: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match monitor.handle_command(&line).await {
                CommandOutcome::Output(output) if output.is_empty() => {}
                CommandOutcome::Output(output) => println!("{output}"),
                CommandOutcome::Exit => break,
            },
            // EOF or an unreadable terminal ends the shell.
            Ok(None) => break,
            Err(err) => {
                error!("cannot read command: {err}");
                break;
            }
        }
    }

    monitor.shutdown().await;
    ExitCode::SUCCESS
}

/// Positional arguments are monitored paths; `--config_files` names JSON
/// files overlaying the default settings, applied in order.
fn settings_from_args(args: impl Iterator<Item = String>) -> Result<Settings, String> {
    let mut settings = Settings::default();
    let mut paths: Vec<PathBuf> = Vec::new();
    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        if arg == "--config_files" {
            let mut any = false;
            while args.peek().is_some_and(|next| !next.starts_with("--")) {
                let file = PathBuf::from(args.next().expect("peeked"));
                settings = Settings::from_file(&file)
                    .map_err(|err| format!("{}: {err}", file.display()))?;
                any = true;
            }
            if !any {
                return Err("--config_files expects at least one file".to_string());
            }
        } else if arg.starts_with("--") {
            return Err(format!("unknown option {arg:?}"));
        } else {
            paths.push(PathBuf::from(arg));
        }
    }
    if !paths.is_empty() {
        settings.paths = paths;
    }
    if settings.paths.is_empty() {
        return Err("no paths given".to_string());
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn positional_paths_override_config() {
        let settings = settings_from_args(args(&["/a", "/b"])).unwrap();
        assert_eq!(settings.paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn missing_paths_is_an_error() {
        assert!(settings_from_args(args(&[])).is_err());
        assert!(settings_from_args(args(&["--config_files"])).is_err());
        assert!(settings_from_args(args(&["--bogus"])).is_err());
    }
}
