use anyhow::Result;
use clap::Parser;
use race_classifier::cli::{Cli, Commands};
use race_classifier::{evaluate, train};

fn main() -> Result<()> {
    // 1. Setup File Logging
    let file_appender = tracing_appender::rolling::daily("logs", "race_classifier.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // 2. Setup Console Logging
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    // 3. Combine Subscribers
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true),
        ) // Stdout
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        ) // File
        .init();

    // 4. Setup Panic Hook
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(target: "panic", "CRASH detected at {}: {}", location, msg);
        eprintln!("CRASH detected at {}: {}", location, msg);
    }));

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train::run(args)?,
        Commands::Evaluate(args) => evaluate::run(args)?,
    }

    Ok(())
}
