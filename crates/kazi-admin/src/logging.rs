use crate::config::LoggingConfig;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// `-v` raises the configured level to debug, `-vv` to trace.
pub fn effective_level(config: &LoggingConfig, cli_verbose: u8) -> &str {
    match cli_verbose {
        0 => &config.level,
        1 => "debug",
        _ => "trace",
    }
}

pub fn build_filter(config: &LoggingConfig, cli_verbose: u8) -> anyhow::Result<EnvFilter> {
    let level = effective_level(config, cli_verbose);
    let mut filter = EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| format!("kazi={level},kazi_rewards={level},kazi_admin={level}")),
    );
    for (module, module_level) in &config.module_filters {
        filter = filter.add_directive(format!("{}={}", module, module_level).parse()?);
    }
    Ok(filter)
}

fn open_log_file(path: &Path) -> anyhow::Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_logging(config: &LoggingConfig, cli_verbose: u8) -> anyhow::Result<()> {
    let filter = build_filter(config, cli_verbose)?;
    let subscriber = tracing_subscriber::registry().with(filter);
    let file = config.file_output.as_deref().map(open_log_file).transpose()?;

    match config.format.as_str() {
        "json" => {
            let layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stderr);
            match file {
                Some(file) => subscriber
                    .with(layer)
                    .with(fmt::layer().json().with_writer(file).with_ansi(false))
                    .init(),
                None => subscriber.with(layer).init(),
            }
        }
        "compact" => {
            let layer = fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            match file {
                Some(file) => subscriber
                    .with(layer)
                    .with(fmt::layer().compact().with_writer(file).with_ansi(false))
                    .init(),
                None => subscriber.with(layer).init(),
            }
        }
        _ => {
            let show_location = cli_verbose > 0;
            let layer = fmt::layer()
                .with_target(show_location)
                .with_line_number(show_location)
                .with_file(show_location)
                .with_writer(std::io::stderr);
            match file {
                Some(file) => subscriber
                    .with(layer)
                    .with(fmt::layer().with_writer(file).with_ansi(false))
                    .init(),
                None => subscriber.with(layer).init(),
            }
        }
    }

    Ok(())
}
