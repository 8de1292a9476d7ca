//! Output files: parameters, encoders and the muxer they feed.

use crate::backend::{Backend, Encoder, EncoderStream, MediaKind, Muxer, Packet};
use crate::{Clip, Error, Rational, Result, Sequence};
use std::{fmt, path::PathBuf, str::FromStr};

/// Codec selection for an output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CodecChoice {
    /// Whatever the container format prefers.
    #[default]
    Auto,
    Named(String),
}

impl FromStr for CodecChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(Error::InvalidConfig("empty codec name".to_string())),
            name if name.eq_ignore_ascii_case("auto") => Ok(CodecChoice::Auto),
            name => Ok(CodecChoice::Named(name.to_string())),
        }
    }
}

impl fmt::Display for CodecChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecChoice::Auto => write!(f, "auto"),
            CodecChoice::Named(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoOutParams {
    pub codec: CodecChoice,
    pub pixel_format: String,
    pub width: u32,
    pub height: u32,
    /// `None` lets the encoder pick.
    pub bit_rate: Option<usize>,
    /// Time base of the frames handed to the encoder.
    pub time_base: Rational,
    pub fps: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioOutParams {
    pub codec: CodecChoice,
    pub sample_format: String,
    pub bit_rate: Option<usize>,
    pub sample_rate: u32,
    pub channels: u16,
    pub time_base: Rational,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputParams {
    pub path: PathBuf,
    pub video: VideoOutParams,
    pub audio: Option<AudioOutParams>,
}

impl OutputParams {
    /// Stream formats copied from `exemplar`, timing taken from `sequence`.
    ///
    /// Codecs and bit rates start out as automatic. The output gets an audio stream only when the
    /// exemplar has one.
    pub fn from_exemplar(
        path: impl Into<PathBuf>,
        exemplar: &Clip,
        sequence: &Sequence,
    ) -> Result<Self> {
        let (video, audio) = {
            let mut handle = exemplar.handle().borrow_mut();
            let was_open = handle.is_open();
            handle.open()?;
            let params = handle.video_params().and_then(|video| {
                handle.audio_params().map(|audio| (video, audio))
            });

            // Reopening on read resets the clip, a handle opened only for this must not stay open
            if !was_open {
                handle.close();
            }
            params?
        };

        if video.width == 0 || video.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "exemplar {exemplar} reports a {}x{} picture",
                video.width, video.height
            )));
        }

        Ok(Self {
            path: path.into(),
            video: VideoOutParams {
                codec: CodecChoice::Auto,
                pixel_format: video.pixel_format,
                width: video.width,
                height: video.height,
                bit_rate: None,
                time_base: sequence.video_time_base(),
                fps: sequence.fps(),
            },
            audio: audio.map(|audio| AudioOutParams {
                codec: CodecChoice::Auto,
                sample_format: audio.sample_format,
                bit_rate: None,
                sample_rate: audio.sample_rate,
                channels: audio.channels,
                time_base: sequence.audio_time_base(),
            }),
        })
    }

    pub fn with_video_codec(mut self, codec: CodecChoice) -> Self {
        self.video.codec = codec;
        self
    }

    pub fn with_video_bit_rate(mut self, bit_rate: Option<usize>) -> Self {
        self.video.bit_rate = bit_rate;
        self
    }

    /// No effect on outputs without audio.
    pub fn with_audio_codec(mut self, codec: CodecChoice) -> Self {
        if let Some(audio) = self.audio.as_mut() {
            audio.codec = codec;
        }
        self
    }

    pub fn with_audio_bit_rate(mut self, bit_rate: Option<usize>) -> Self {
        if let Some(audio) = self.audio.as_mut() {
            audio.bit_rate = bit_rate;
        }
        self
    }
}

/// Encoder side of one output stream.
pub(crate) struct StreamState {
    pub(crate) kind: MediaKind,
    pub(crate) encoder: Box<dyn Encoder>,
    pub(crate) stream_index: usize,
    pub(crate) stream_time_base: Rational,
    /// Flush signal sent, draining what the encoder still holds.
    pub(crate) flushing: bool,
    /// The encoder refused the flush signal, resent once it asks for input.
    pub(crate) flush_pending: bool,
    pub(crate) done_flush: bool,
    /// Frame the encoder refused while full, resent before anything new.
    pub(crate) pending: Option<crate::Frame>,
}

impl StreamState {
    fn new(kind: MediaKind, stream: EncoderStream) -> Self {
        Self {
            kind,
            encoder: stream.encoder,
            stream_index: stream.stream_index,
            stream_time_base: stream.stream_time_base,
            flushing: false,
            flush_pending: false,
            done_flush: false,
            pending: None,
        }
    }

    /// Move an encoded packet into the output stream's time base and index.
    pub(crate) fn stamp(&self, mut packet: Packet) -> Packet {
        packet.rescale_ts(self.encoder.time_base(), self.stream_time_base);
        packet.stream_index = self.stream_index;
        packet.kind = Some(self.kind);
        packet
    }
}

/// An output file being written: one muxer and an encoder per stream.
pub struct OutputContext {
    params: OutputParams,
    muxer: Box<dyn Muxer>,
    pub(crate) video: StreamState,
    pub(crate) audio: Option<StreamState>,
    /// Kind of the frame most recently handed to an encoder.
    pub(crate) last_sent: Option<MediaKind>,
    packets_written: usize,
    finished: bool,
}

impl OutputContext {
    /// Create the file, its streams and encoders, and write the header.
    pub fn open(backend: &dyn Backend, params: OutputParams) -> Result<Self> {
        params.video.time_base.validate()?;
        if let Some(audio) = &params.audio {
            audio.time_base.validate()?;
            if audio.sample_rate == 0 || audio.channels == 0 {
                return Err(Error::InvalidConfig(format!(
                    "audio output needs a sample rate and channels, got {} Hz x {}",
                    audio.sample_rate, audio.channels
                )));
            }
        }
        if !params.video.fps.is_finite() || params.video.fps <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "video output fps must be positive, got {}",
                params.video.fps
            )));
        }

        let parts = backend.create_output(&params)?;
        log::info!(
            "opened output {} via {}: video {} {}x{} {}, audio {}",
            params.path.display(),
            backend.name(),
            params.video.codec,
            params.video.width,
            params.video.height,
            params.video.pixel_format,
            params
                .audio
                .as_ref()
                .map(|a| format!("{} {} Hz x {}", a.codec, a.sample_rate, a.channels))
                .unwrap_or_else(|| "none".to_string()),
        );

        Ok(Self {
            params,
            muxer: parts.muxer,
            video: StreamState::new(MediaKind::Video, parts.video),
            audio: parts
                .audio
                .map(|stream| StreamState::new(MediaKind::Audio, stream)),
            last_sent: None,
            packets_written: 0,
            finished: false,
        })
    }

    pub fn params(&self) -> &OutputParams {
        &self.params
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn packets_written(&self) -> usize {
        self.packets_written
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn stream(&self, kind: MediaKind) -> Option<&StreamState> {
        match kind {
            MediaKind::Video => Some(&self.video),
            MediaKind::Audio => self.audio.as_ref(),
        }
    }

    pub(crate) fn stream_mut(&mut self, kind: MediaKind) -> Option<&mut StreamState> {
        match kind {
            MediaKind::Video => Some(&mut self.video),
            MediaKind::Audio => self.audio.as_mut(),
        }
    }

    pub fn write_packet(&mut self, packet: Packet) -> Result<()> {
        if self.finished {
            return Err(Error::Backend(format!(
                "{} is already finished",
                self.params.path.display()
            )));
        }

        self.muxer.write_packet(packet)?;
        self.packets_written += 1;
        Ok(())
    }

    /// Write the trailer. Calling it again does nothing.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            log::warn!("{} finished twice", self.params.path.display());
            return Ok(());
        }

        self.muxer.write_trailer()?;
        self.finished = true;
        log::info!(
            "finished {}: {} packets",
            self.params.path.display(),
            self.packets_written
        );
        Ok(())
    }
}

impl fmt::Debug for OutputContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputContext")
            .field("params", &self.params)
            .field("last_sent", &self.last_sent)
            .field("packets_written", &self.packets_written)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SyntheticBackend, SyntheticMedia};
    use crate::sequence::SequenceConfig;
    use std::rc::Rc;

    fn exemplar(media: SyntheticMedia) -> Result<(Rc<SyntheticBackend>, Clip)> {
        let backend = Rc::new(SyntheticBackend::new());
        backend.register("a.mp4", media);
        let dyn_backend: Rc<dyn Backend> = backend.clone();
        Ok((backend, Clip::open_file(dyn_backend, "a.mp4")?))
    }

    #[test]
    fn test_codec_choice_parse() -> Result<()> {
        assert_eq!("auto".parse::<CodecChoice>()?, CodecChoice::Auto);
        assert_eq!("AUTO".parse::<CodecChoice>()?, CodecChoice::Auto);
        assert_eq!(
            "libx264".parse::<CodecChoice>()?,
            CodecChoice::Named("libx264".to_string())
        );
        assert!("  ".parse::<CodecChoice>().is_err());
        assert_eq!(CodecChoice::Named("aac".to_string()).to_string(), "aac");
        Ok(())
    }

    #[test]
    fn test_from_exemplar() -> Result<()> {
        let (_, clip) = exemplar(SyntheticMedia::default().with_width(1280).with_height(720))?;
        let seq = Sequence::new(SequenceConfig::default())?;

        let params = OutputParams::from_exemplar("out.mp4", &clip, &seq)?
            .with_video_bit_rate(Some(4_000_000))
            .with_audio_codec(CodecChoice::Named("aac".to_string()));

        assert_eq!(params.video.width, 1280);
        assert_eq!(params.video.height, 720);
        assert_eq!(params.video.pixel_format, "yuv420p");
        assert_eq!(params.video.time_base, Rational::new(1, 30000));
        assert_eq!(params.video.bit_rate, Some(4_000_000));
        assert_eq!(params.video.codec, CodecChoice::Auto);

        let audio = params.audio.expect("audio params");
        assert_eq!(audio.sample_rate, 48000);
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.sample_format, "fltp");
        assert_eq!(audio.time_base, Rational::new(1, 48000));
        assert_eq!(audio.codec, CodecChoice::Named("aac".to_string()));
        Ok(())
    }

    #[test]
    fn test_from_exemplar_leaves_closed_handle_closed() -> Result<()> {
        let (backend, mut clip) = exemplar(SyntheticMedia::default().without_audio())?;
        let seq = Sequence::new(SequenceConfig::default())?;
        clip.close();

        let params = OutputParams::from_exemplar("out.mp4", &clip, &seq)?;
        assert!(params.audio.is_none());
        assert!(!clip.is_open());
        assert_eq!(backend.open_count("a.mp4"), 2);
        Ok(())
    }

    #[test]
    fn test_open_write_finish() -> Result<()> {
        let (backend, clip) = exemplar(SyntheticMedia::default())?;
        let seq = Sequence::new(SequenceConfig::default())?;
        let params = OutputParams::from_exemplar("out.mp4", &clip, &seq)?;

        let mut output = OutputContext::open(&*backend, params)?;
        assert!(output.has_audio());
        output.write_packet(Packet::new(0, Some(0), vec![1, 2, 3]))?;
        output.finish()?;
        output.finish()?;
        assert!(output.write_packet(Packet::new(0, Some(1), vec![])).is_err());

        let muxed = backend.output("out.mp4").expect("muxed output");
        assert!(muxed.header_written);
        assert!(muxed.trailer_written);
        assert_eq!(muxed.packets.len(), 1);
        assert_eq!(output.packets_written(), 1);
        Ok(())
    }

    #[test]
    fn test_open_rejects_bad_params() -> Result<()> {
        let (backend, clip) = exemplar(SyntheticMedia::default())?;
        let seq = Sequence::new(SequenceConfig::default())?;
        let params = OutputParams::from_exemplar("out.mp4", &clip, &seq)?;

        let mut silent = params.clone();
        if let Some(audio) = silent.audio.as_mut() {
            audio.channels = 0;
        }
        assert!(OutputContext::open(&*backend, silent).is_err());

        let mut still = params;
        still.video.fps = 0.0;
        assert!(OutputContext::open(&*backend, still).is_err());
        assert!(backend.output("out.mp4").is_none());
        Ok(())
    }
}
