use clap::Parser;
use tunnelproxy::cli::Cli;
use tunnelproxy::logging::LoggingConfig;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    LoggingConfig {
        debug: config.debug,
        ..Default::default()
    }
    .init();

    let code = tunnelproxy::app::run(config).await;
    std::process::ExitCode::from(code as u8)
}
