//! Process wide `tracing` setup.
use std::{
    io::{Sink, sink},
    path::Path,
};

use snafu::{ResultExt, Snafu};
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{
    EnvFilter, Registry,
    filter::ParseError,
    fmt::{
        MakeWriter,
        writer::{EitherWriter, MakeWriterExt as _},
    },
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// The environment variable the log filter directives are read from.
pub const LOG_ENV_VAR: &str = "SIDECARGO_OPERATOR_LOG";

#[derive(Debug, Snafu)]
pub enum LoggingError {
    #[snafu(display("failed to initialize default tracing level to INFO"))]
    DefaultFilter { source: ParseError },

    #[snafu(display("failed to initialize rolling file appender in {directory:?}"))]
    RollingFileAppender {
        source: InitError,
        directory: std::path::PathBuf,
    },

    #[snafu(display("failed to install global tracing subscriber"))]
    InstallSubscriber { source: TryInitError },
}

/// Initializes `tracing` logging with the filter directives read from
/// [`LOG_ENV_VAR`]. If the variable is unset or invalid, the maximum log
/// level is INFO.
///
/// Log output is copied to rotated files named after `app_name` if a
/// `log_directory` is given.
pub fn initialize_logging(
    app_name: &str,
    log_directory: Option<&Path>,
) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_env(LOG_ENV_VAR) {
        Ok(env_filter) => env_filter,
        _ => EnvFilter::try_new(tracing::Level::INFO.to_string()).context(DefaultFilterSnafu)?,
    };

    let file_appender = log_directory
        .map(|directory| {
            RollingFileAppender::builder()
                .filename_suffix(format!("{app_name}.log"))
                .max_log_files(6)
                .build(directory)
                .context(RollingFileAppenderSnafu { directory })
        })
        .transpose()?;
    let file_appender = OptionalMakeWriter::from(file_appender);

    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stdout.and(file_appender));
    Registry::default()
        .with(filter)
        .with(fmt)
        .try_init()
        .context(InstallSubscriberSnafu)?;

    // need to delay logging until after tracing is initialized
    match log_directory {
        Some(dir) => tracing::info!(directory = %dir.display(), "file logging enabled"),
        None => tracing::debug!("file logging disabled, because no log directory set"),
    }

    Ok(())
}

/// Like [`EitherWriter`] but implements [`MakeWriter`] instead of [`std::io::Write`].
/// For selecting writers depending on dynamic configuration.
enum EitherMakeWriter<A, B> {
    A(A),
    B(B),
}

impl<'a, A, B> MakeWriter<'a> for EitherMakeWriter<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = EitherWriter<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        match self {
            Self::A(a) => EitherWriter::A(a.make_writer()),
            Self::B(b) => EitherWriter::B(b.make_writer()),
        }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        match self {
            Self::A(a) => EitherWriter::A(a.make_writer_for(meta)),
            Self::B(b) => EitherWriter::B(b.make_writer_for(meta)),
        }
    }
}

type OptionalMakeWriter<T> = EitherMakeWriter<T, fn() -> Sink>;

impl<T> From<Option<T>> for OptionalMakeWriter<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(t) => Self::A(t),
            None => Self::B(sink),
        }
    }
}
