use thiserror::Error;

/// Failure while turning a pixel buffer into a star list.
///
/// Pathological-but-valid input (uniform frames, saturated frames, pure noise)
/// is not an error: extraction returns an empty [`StarList`](crate::StarList)
/// instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionError {
    #[error("pixel buffer is empty ({width}x{height}, {channels} channel(s))")]
    EmptyBuffer {
        width: u32,
        height: u32,
        channels: u32,
    },
    #[error("pixel buffer holds {actual} samples, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("statistics supplied for {actual} channel(s), buffer has {expected}")]
    StatisticsMismatch { expected: usize, actual: usize },
    #[error("channel {channel} out of range (buffer has {channels})")]
    InvalidChannel { channel: u32, channels: u32 },
    #[error("subframe ({x}, {y}, {width}x{height}) does not intersect the {image_width}x{image_height} image")]
    InvalidSubframe {
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        image_width: u32,
        image_height: u32,
    },
    #[error("extraction aborted")]
    Aborted,
}

/// Failure of a plate solve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    /// The search budget ran out (or the candidates were exhausted) before
    /// any candidate reached the to-solve log-odds threshold.
    #[error("no solution found")]
    NoSolution,
    /// An external cancellation was observed before completion.
    #[error("solve aborted")]
    Aborted,
    /// No loaded index file can cover the requested scale / position.
    #[error("no usable index: {0}")]
    IndexUnavailable(String),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}
