//! Tracing setup for the binary: console plus optional log file, both
//! filtered through `RUST_LOG`.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt};

/// Start logging to console and, optionally, a file.
pub fn initiate_logging<P: AsRef<Path>>(
    path: Option<P>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let file_layer = match &path {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let writer = std::sync::Mutex::new(file);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let console_layer = fmt::layer().with_ansi(!cfg!(windows));

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(tracing_subscriber::filter::EnvFilter::from_default_env());
    tracing::subscriber::set_global_default(collector)?;

    if let Some(path) = &path {
        tracing::debug!("logging to file {}", path.as_ref().display());
    }
    Ok(())
}
