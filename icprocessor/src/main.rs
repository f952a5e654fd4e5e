use std::io;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use icprocessor::{ICProcessor, ICProcessorError};

fn configure_log(args: &ICProcessor) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stderr_layer = fmt::layer()
        .compact()
        .with_timer(fmt::time::ChronoLocal::rfc_3339())
        .with_writer(io::stderr)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        );

    let (file_layer, guard) = if let Some(log_file) = &args.log_file {
        let dir = log_file.parent().filter(|p| !p.as_os_str().is_empty());
        let name = log_file.file_name().map(std::path::PathBuf::from);
        let appender = tracing_appender::rolling::never(
            dir.unwrap_or(std::path::Path::new(".")),
            name.unwrap_or_else(|| "icprocessor.log".into()),
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_ansi(false)
            .with_timer(fmt::time::ChronoLocal::rfc_3339())
            .with_writer(writer)
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(tracing::Level::DEBUG.into())
                    .from_env_lossy(),
            );
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

/// Layer the command line under `icprocessor.toml`, an explicit
/// configuration file, and `ICPROCESSOR_`-prefixed environment variables.
fn resolve_config(args: ICProcessor) -> Result<ICProcessor, ICProcessorError> {
    let config_file = args.config_file.clone();
    let mut config = Figment::from(Serialized::defaults(args)).merge(Toml::file("icprocessor.toml"));
    if let Some(path) = &config_file {
        config = config.merge(Toml::file_exact(path));
    }
    let app = config.merge(Env::prefixed("ICPROCESSOR_")).extract()?;
    Ok(app)
}

fn main() -> Result<(), ICProcessorError> {
    let args = ICProcessor::parse();
    let _guard = configure_log(&args);
    let app = resolve_config(args)?;
    app.main()?;
    Ok(())
}
