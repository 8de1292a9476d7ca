//! Non-linear editing engine: clips trimmed out of source files, arranged on a gapless sequence,
//! decoded, re-timestamped into sequence time and encoded into a new file.

pub mod backend;
pub mod clip;
pub mod clip_decode;
pub mod encode;
pub mod media;
pub mod output;
pub mod rational;
pub mod sequence;
pub mod sequence_decode;

pub use backend::{Backend, Frame, MediaKind, Packet};
pub use clip::{Clip, ClipId, ClipOutcome};
pub use encode::{EncodeOutcome, FrameSource, SourceFrame};
pub use media::{DecoderStream, MediaHandle, SharedHandle};
pub use output::{AudioOutParams, CodecChoice, OutputContext, OutputParams, VideoOutParams};
pub use rational::{Rational, convert};
pub use sequence::{InsertOrder, Sequence, SequenceConfig, SequenceOutcome, SequencePacket};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO Error {0}")]
    IO(#[from] std::io::Error),
    #[error("Backend Error: {0}")]
    Backend(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid time base {0}")]
    InvalidTimeBase(Rational),
    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),
    #[error("No video stream found in {0}")]
    NoVideoStream(String),
    #[error("Media handle is not open: {0}")]
    NotOpen(String),
    #[error("No clip covers sequence frame {0}")]
    NoClipAtFrame(i64),
    #[error("Clip {0} is not part of the sequence")]
    ClipNotFound(ClipId),
}
