//! Media codec backend seam.
//!
//! The engine only talks to demuxers, decoders, encoders and muxers through the traits in this
//! module. Concrete backends live in submodules: [`synthetic`] is always available, `ffmpeg` is
//! compiled in with the `ffmpeg` cargo feature.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub mod synthetic;

use crate::output::OutputParams;
use crate::{Rational, Result, rational};
use std::{fmt, path::Path, time::SystemTime};

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegBackend;
pub use synthetic::{SyntheticAudio, SyntheticBackend, SyntheticMedia};

/// Which elementary stream a packet or frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Result of pushing input into a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Accepted,
    /// Output must be drained before more input is taken.
    Full,
}

/// Result of pulling output from a codec.
#[derive(Debug)]
pub enum Pull<T> {
    Ready(T),
    NeedsInput,
    /// Fully flushed, nothing more will come out.
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: Option<MediaKind>,
    pub time_base: Rational,
    /// Stream duration in `time_base` units, zero or negative when unknown.
    pub duration: i64,
    /// Number of frames, zero or negative when unknown.
    pub frame_count: i64,
    pub avg_frame_rate: Rational,
}

/// Everything the engine learns from probing an input file.
#[derive(Debug, Clone, Default)]
pub struct ProbeInfo {
    pub streams: Vec<StreamInfo>,
    pub best_video: Option<usize>,
    pub best_audio: Option<usize>,
    pub container_duration_secs: f64,
    pub modified: Option<SystemTime>,
}

impl ProbeInfo {
    pub fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.index == index)
    }
}

/// Codec parameters reported by an opened decoder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodecParams {
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub sample_rate: u32,
    pub sample_format: String,
    pub channels: u16,
    pub bit_rate: usize,
}

pub(crate) enum PacketPayload {
    Bytes(Vec<u8>),
    #[cfg(feature = "ffmpeg")]
    Ffmpeg(ffmpeg_next::Packet),
}

/// A compressed packet owned by the engine.
pub struct Packet {
    pub stream_index: usize,
    pub kind: Option<MediaKind>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub key: bool,
    pub(crate) payload: PacketPayload,
}

impl Packet {
    pub fn new(stream_index: usize, pts: Option<i64>, data: Vec<u8>) -> Self {
        Self {
            stream_index,
            kind: None,
            pts,
            dts: pts,
            duration: 0,
            key: false,
            payload: PacketPayload::Bytes(data),
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.payload {
            PacketPayload::Bytes(data) => data,
            #[cfg(feature = "ffmpeg")]
            PacketPayload::Ffmpeg(packet) => packet.data().unwrap_or(&[]),
        }
    }

    pub fn size(&self) -> usize {
        self.data().len()
    }

    /// Timestamp used for bound checks: pts, falling back to dts.
    pub fn timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }

    pub fn rescale_ts(&mut self, from: Rational, to: Rational) {
        if from == to {
            return;
        }
        self.pts = self.pts.map(|ts| rational::convert(ts, from, to));
        self.dts = self.dts.map(|ts| rational::convert(ts, from, to));
        self.duration = rational::convert(self.duration, from, to);
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("stream_index", &self.stream_index)
            .field("kind", &self.kind)
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("duration", &self.duration)
            .field("key", &self.key)
            .field("size", &self.size())
            .finish()
    }
}

pub(crate) enum FramePayload {
    Samples(Vec<u8>),
    #[cfg(feature = "ffmpeg")]
    Video(ffmpeg_next::frame::Video),
    #[cfg(feature = "ffmpeg")]
    Audio(ffmpeg_next::frame::Audio),
}

/// A decoded frame owned by the engine.
///
/// `pts` and `key_frame` are authoritative: backends apply them to the payload before encoding.
pub struct Frame {
    pub kind: MediaKind,
    pub pts: Option<i64>,
    pub key_frame: bool,
    pub(crate) payload: FramePayload,
}

impl Frame {
    pub fn new(kind: MediaKind, pts: Option<i64>, data: Vec<u8>) -> Self {
        Self {
            kind,
            pts,
            key_frame: false,
            payload: FramePayload::Samples(data),
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    pub fn data(&self) -> &[u8] {
        match &self.payload {
            FramePayload::Samples(data) => data,
            #[cfg(feature = "ffmpeg")]
            FramePayload::Video(frame) => frame.data(0),
            #[cfg(feature = "ffmpeg")]
            FramePayload::Audio(frame) => frame.data(0),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("pts", &self.pts)
            .field("key_frame", &self.key_frame)
            .finish()
    }
}

pub trait Demuxer {
    fn probe(&self) -> &ProbeInfo;

    /// Seek `stream` to the nearest keyframe at or before `ts` (stream time base).
    fn seek(&mut self, stream: usize, ts: i64) -> Result<()>;

    /// Next packet in file order, `None` at end of file.
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    fn open_decoder(&mut self, stream: usize) -> Result<Box<dyn Decoder>>;
}

pub trait Decoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<Push>;
    fn receive_frame(&mut self) -> Result<Pull<Frame>>;

    /// Drop buffered input and output, used after seeking.
    fn flush(&mut self);

    fn parameters(&self) -> CodecParams;
}

pub trait Encoder {
    fn time_base(&self) -> Rational;

    /// `None` signals end of input and starts flushing.
    fn send_frame(&mut self, frame: Option<&mut Frame>) -> Result<Push>;

    fn receive_packet(&mut self) -> Result<Pull<Packet>>;
}

pub trait Muxer {
    fn write_packet(&mut self, packet: Packet) -> Result<()>;
    fn write_trailer(&mut self) -> Result<()>;
}

/// One encoder bound to its output stream.
pub struct EncoderStream {
    pub encoder: Box<dyn Encoder>,
    pub stream_index: usize,
    pub stream_time_base: Rational,
}

/// A freshly created output whose header has been written.
pub struct OutputParts {
    pub muxer: Box<dyn Muxer>,
    pub video: EncoderStream,
    pub audio: Option<EncoderStream>,
}

pub trait Backend {
    fn name(&self) -> &'static str;
    fn open_input(&self, path: &Path) -> Result<Box<dyn Demuxer>>;
    fn create_output(&self, params: &OutputParams) -> Result<OutputParts>;
}
