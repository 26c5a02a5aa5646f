use snafu::Snafu;

/// Errors that end an extraction run.
///
/// Every variant carries the reason supplied by the archive reader.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum ExtractionError {
    #[snafu(display("{reason}"))]
    ReopenFailed { reason: String },

    #[snafu(display("{reason}"))]
    PrepareFailed { reason: String },

    #[snafu(display("cannot extract file #{index}: {reason}"))]
    ExtractFileFailed { index: usize, reason: String },

    #[snafu(display("cannot start extraction worker: {source}"))]
    SpawnFailed { source: std::io::Error },
}
