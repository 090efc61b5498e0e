use ftpsyncd::daemon::{DaemonConfig, DaemonRuntime, check_config};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    CheckConfig,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--check-config" => mode = CliMode::CheckConfig,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: ftpsyncd [--once] [--check-config]");
        println!("  --once           Run one sync cycle per target and exit");
        println!("  --check-config   Validate configured targets and exit");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    match mode {
        CliMode::CheckConfig => {
            let (targets, errors) = check_config(&config).await?;
            for target in &targets {
                println!(
                    "ok      {} ({}, {} -> {})",
                    target.id,
                    target.mode.as_str(),
                    target.local_root.display(),
                    target.remote_root
                );
            }
            for err in &errors {
                println!("invalid {err}");
            }
            if !errors.is_empty() {
                anyhow::bail!("{} invalid target(s)", errors.len());
            }
            Ok(())
        }
        CliMode::Once => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            for summary in daemon.run_once().await? {
                println!(
                    "{}: planned={} succeeded={} failed={}{}",
                    summary.target_id,
                    summary.planned,
                    summary.succeeded,
                    summary.failed,
                    if summary.remote_unavailable {
                        " (remote unavailable)"
                    } else {
                        ""
                    }
                );
            }
            Ok(())
        }
        CliMode::Run | CliMode::Help => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            daemon.run().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Vec<String> {
        std::iter::once("ftpsyncd")
            .chain(extra.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_once_and_check() {
        assert_eq!(parse_cli_mode(args(&["--once"])).unwrap(), CliMode::Once);
        assert_eq!(
            parse_cli_mode(args(&["--check-config"])).unwrap(),
            CliMode::CheckConfig
        );
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse_cli_mode(args(&["-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(args(&["--logout"])).is_err());
    }
}
