//! Media handles: one demuxer plus its decoders for a physical source file.
//!
//! A handle is shared by every clip cut from the same file. The stream metadata it learns on the
//! first open survives `close`, so a handle can be closed to release backend resources and
//! reopened later without being rebuilt.

use crate::backend::{
    Backend, CodecParams, Decoder, Demuxer, Frame, MediaKind, Packet, Pull, Push, StreamInfo,
};
use crate::{Error, Rational, Result, rational};
use std::{
    cell::RefCell,
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
    time::SystemTime,
};

/// Reference-counted handle. The strong count is the number of clips holding it.
pub type SharedHandle = Rc<RefCell<MediaHandle>>;

/// Decoder that received the most recent packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderStream {
    #[default]
    None,
    Video,
    Audio,
}

impl From<MediaKind> for DecoderStream {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Video => DecoderStream::Video,
            MediaKind::Audio => DecoderStream::Audio,
        }
    }
}

struct OpenInput {
    demuxer: Box<dyn Demuxer>,
    video_decoder: Box<dyn Decoder>,
    audio_decoder: Option<Box<dyn Decoder>>,
}

pub struct MediaHandle {
    path: PathBuf,
    backend: Rc<dyn Backend>,
    input: Option<OpenInput>,

    video_stream: Option<usize>,
    audio_stream: Option<usize>,
    video_time_base: Rational,
    audio_time_base: Rational,
    fps: f64,
    duration: i64,
    frame_count: i64,
    frame_duration: i64,
    modified: Option<SystemTime>,

    curr_pts: i64,
    seek_pts: i64,
    last_decoder_stream: DecoderStream,

    // Packet a full decoder refused, resent before anything new is read.
    stalled_packet: Option<Packet>,
}

impl MediaHandle {
    /// Create an unopened handle.
    pub fn new(backend: Rc<dyn Backend>, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backend,
            input: None,
            video_stream: None,
            audio_stream: None,
            video_time_base: Rational::default(),
            audio_time_base: Rational::default(),
            fps: 0.0,
            duration: 0,
            frame_count: 0,
            frame_duration: 0,
            modified: None,
            curr_pts: 0,
            seek_pts: 0,
            last_decoder_stream: DecoderStream::None,
            stalled_packet: None,
        }
    }

    /// Create and open a handle ready to be shared between clips.
    pub fn open_shared(backend: Rc<dyn Backend>, path: impl Into<PathBuf>) -> Result<SharedHandle> {
        let mut handle = Self::new(backend, path);
        handle.open()?;
        Ok(Rc::new(RefCell::new(handle)))
    }

    /// Open the demuxer and decoders. Opening an open handle does nothing.
    pub fn open(&mut self) -> Result<()> {
        if self.input.is_some() {
            return Ok(());
        }

        let mut demuxer = self.backend.open_input(&self.path)?;
        let probe = demuxer.probe().clone();

        let video = probe
            .best_video
            .and_then(|index| probe.stream(index))
            .filter(|stream| stream.kind == Some(MediaKind::Video))
            .cloned()
            .ok_or_else(|| Error::NoVideoStream(self.path.display().to_string()))?;
        let video_time_base = video.time_base.validate()?;

        let audio = probe
            .best_audio
            .and_then(|index| probe.stream(index))
            .filter(|stream| stream.kind == Some(MediaKind::Audio))
            .cloned();
        let audio_time_base = match &audio {
            Some(stream) => stream.time_base.validate()?,
            None => Rational::default(),
        };

        let (duration, frame_count, fps) =
            Self::stream_timing(&video, probe.container_duration_secs)?;
        let frame_duration = duration / frame_count;
        if frame_duration <= 0 {
            return Err(Error::InvalidConfig(format!(
                "{}: frame duration rounds to zero ({duration} / {frame_count})",
                self.path.display()
            )));
        }

        let video_decoder = demuxer.open_decoder(video.index)?;
        let audio_decoder = audio
            .as_ref()
            .map(|stream| demuxer.open_decoder(stream.index))
            .transpose()?;

        self.video_stream = Some(video.index);
        self.audio_stream = audio.as_ref().map(|stream| stream.index);
        self.video_time_base = video_time_base;
        self.audio_time_base = audio_time_base;
        self.duration = duration;
        self.frame_count = frame_count;
        self.frame_duration = frame_duration;
        self.fps = fps;
        self.modified = probe.modified;
        self.curr_pts = 0;
        self.seek_pts = 0;
        self.last_decoder_stream = DecoderStream::None;
        self.stalled_packet = None;
        self.input = Some(OpenInput {
            demuxer,
            video_decoder,
            audio_decoder,
        });

        log::debug!(
            "opened {} via {}: video tb {}, audio tb {}, {} frames of {} ({:.3} fps)",
            self.path.display(),
            self.backend.name(),
            self.video_time_base,
            self.audio_time_base,
            self.frame_count,
            self.frame_duration,
            self.fps,
        );
        Ok(())
    }

    /// Duration, frame count and fps for the video stream, estimated from container metadata when
    /// the stream does not carry them.
    fn stream_timing(video: &StreamInfo, container_secs: f64) -> Result<(i64, i64, f64)> {
        if video.duration > 0 && video.frame_count > 0 {
            let secs = video.duration as f64 * video.time_base.as_f64();
            let fps = if video.avg_frame_rate.is_valid() {
                video.avg_frame_rate.as_f64()
            } else {
                video.frame_count as f64 / secs
            };
            return Ok((video.duration, video.frame_count, fps));
        }

        if !video.avg_frame_rate.is_valid() || container_secs <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "stream {} has no duration metadata and no usable frame rate",
                video.index
            )));
        }

        let fps = video.avg_frame_rate.as_f64();
        let duration = (container_secs / video.time_base.as_f64()).round() as i64;
        let frame_count = (container_secs * fps).round() as i64;
        if duration <= 0 || frame_count <= 0 {
            return Err(Error::InvalidConfig(format!(
                "stream {} duration estimate is empty",
                video.index
            )));
        }

        log::warn!(
            "stream {} lacks duration metadata, estimated {frame_count} frames from {container_secs:.3}s at {fps:.3} fps",
            video.index
        );
        Ok((duration, frame_count, fps))
    }

    /// Release the demuxer and decoders. Metadata is kept for a later reopen.
    pub fn close(&mut self) {
        if self.input.take().is_some() {
            log::debug!("closed {}", self.path.display());
        }
        self.last_decoder_stream = DecoderStream::None;
        self.stalled_packet = None;
    }

    pub fn is_open(&self) -> bool {
        self.input.is_some()
    }

    /// Seek to the keyframe at or before `video_pts` and drop any buffered decoder state.
    pub fn seek(&mut self, video_pts: i64) -> Result<()> {
        if video_pts < 0 {
            return Err(Error::InvalidBounds(format!("negative seek target {video_pts}")));
        }

        let path = &self.path;
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| Error::NotOpen(path.display().to_string()))?;
        let stream = self
            .video_stream
            .ok_or_else(|| Error::NoVideoStream(path.display().to_string()))?;

        input.demuxer.seek(stream, video_pts)?;
        input.video_decoder.flush();
        if let Some(decoder) = input.audio_decoder.as_mut() {
            decoder.flush();
        }

        self.seek_pts = video_pts;
        self.curr_pts = video_pts;
        self.last_decoder_stream = DecoderStream::None;
        self.stalled_packet = None;

        log::trace!("{} seek to {video_pts}", self.path.display());
        Ok(())
    }

    /// Frame index of `pts`, assuming a constant frame rate.
    pub fn frame_index_for_pts(&self, pts: i64) -> i64 {
        if self.frame_duration > 0 {
            pts / self.frame_duration
        } else {
            0
        }
    }

    pub fn pts_for_frame_index(&self, frame_index: i64) -> i64 {
        frame_index * self.frame_duration
    }

    /// `None` when the source has no audio.
    pub fn audio_pts_for_video_pts(&self, video_pts: i64) -> Option<i64> {
        self.audio_stream
            .map(|_| rational::convert(video_pts, self.video_time_base, self.audio_time_base))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend(&self) -> Rc<dyn Backend> {
        self.backend.clone()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_stream.is_some()
    }

    pub fn video_stream_index(&self) -> Option<usize> {
        self.video_stream
    }

    pub fn audio_stream_index(&self) -> Option<usize> {
        self.audio_stream
    }

    pub fn video_time_base(&self) -> Rational {
        self.video_time_base
    }

    pub fn audio_time_base(&self) -> Rational {
        self.audio_time_base
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Stream duration in video time base units.
    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn frame_count(&self) -> i64 {
        self.frame_count
    }

    pub fn frame_duration(&self) -> i64 {
        self.frame_duration
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub fn curr_pts(&self) -> i64 {
        self.curr_pts
    }

    pub fn seek_pts(&self) -> i64 {
        self.seek_pts
    }

    pub fn last_decoder_stream(&self) -> DecoderStream {
        self.last_decoder_stream
    }

    pub fn video_params(&self) -> Result<CodecParams> {
        Ok(self.opened()?.video_decoder.parameters())
    }

    pub fn audio_params(&self) -> Result<Option<CodecParams>> {
        Ok(self
            .opened()?
            .audio_decoder
            .as_ref()
            .map(|decoder| decoder.parameters()))
    }

    fn opened(&self) -> Result<&OpenInput> {
        self.input
            .as_ref()
            .ok_or_else(|| Error::NotOpen(self.path.display().to_string()))
    }

    fn opened_mut(&mut self) -> Result<&mut OpenInput> {
        let path = &self.path;
        self.input
            .as_mut()
            .ok_or_else(|| Error::NotOpen(path.display().to_string()))
    }

    pub(crate) fn set_curr_pts(&mut self, pts: i64) {
        self.curr_pts = pts;
    }

    pub(crate) fn set_last_decoder_stream(&mut self, stream: DecoderStream) {
        self.last_decoder_stream = stream;
    }

    pub(crate) fn kind_of_stream(&self, index: usize) -> Option<MediaKind> {
        if Some(index) == self.video_stream {
            Some(MediaKind::Video)
        } else if Some(index) == self.audio_stream {
            Some(MediaKind::Audio)
        } else {
            None
        }
    }

    /// Next demuxed packet tagged with its media kind, `None` at end of file.
    pub(crate) fn read_raw_packet(&mut self) -> Result<Option<Packet>> {
        let packet = self.opened_mut()?.demuxer.read_packet()?;
        Ok(packet.map(|mut packet| {
            packet.kind = self.kind_of_stream(packet.stream_index);
            packet
        }))
    }

    pub(crate) fn take_stalled_packet(&mut self) -> Option<Packet> {
        self.stalled_packet.take()
    }

    pub(crate) fn stall_packet(&mut self, packet: Packet) {
        self.stalled_packet = Some(packet);
    }

    pub(crate) fn send_packet(&mut self, kind: MediaKind, packet: &Packet) -> Result<Push> {
        let input = self.opened_mut()?;
        match kind {
            MediaKind::Video => input.video_decoder.send_packet(packet),
            MediaKind::Audio => match input.audio_decoder.as_mut() {
                Some(decoder) => decoder.send_packet(packet),
                None => Ok(Push::Accepted),
            },
        }
    }

    pub(crate) fn receive_frame(&mut self, kind: MediaKind) -> Result<Pull<Frame>> {
        let input = self.opened_mut()?;
        match kind {
            MediaKind::Video => input.video_decoder.receive_frame(),
            MediaKind::Audio => match input.audio_decoder.as_mut() {
                Some(decoder) => decoder.receive_frame(),
                None => Ok(Pull::NeedsInput),
            },
        }
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("video_stream", &self.video_stream)
            .field("audio_stream", &self.audio_stream)
            .field("video_time_base", &self.video_time_base)
            .field("audio_time_base", &self.audio_time_base)
            .field("frame_duration", &self.frame_duration)
            .field("seek_pts", &self.seek_pts)
            .field("curr_pts", &self.curr_pts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SyntheticBackend, SyntheticMedia};

    fn backend_with(media: SyntheticMedia) -> Rc<dyn Backend> {
        let backend = SyntheticBackend::new();
        backend.register("a.mp4", media);
        Rc::new(backend)
    }

    #[test]
    fn test_open_reads_stream_metadata() -> Result<()> {
        let mut handle = MediaHandle::new(backend_with(SyntheticMedia::default()), "a.mp4");
        assert!(!handle.is_open());

        handle.open()?;
        assert!(handle.is_open());
        assert_eq!(handle.video_stream_index(), Some(0));
        assert_eq!(handle.audio_stream_index(), Some(1));
        assert_eq!(handle.video_time_base(), Rational::new(1, 30000));
        assert_eq!(handle.audio_time_base(), Rational::new(1, 48000));
        assert_eq!(handle.frame_count(), 300);
        assert_eq!(handle.frame_duration(), 1001);
        assert!((handle.fps() - 29.97).abs() < 0.01);
        Ok(())
    }

    #[test]
    fn test_open_estimates_missing_metadata() -> Result<()> {
        let media = SyntheticMedia::default().with_stream_metadata(false);
        let mut handle = MediaHandle::new(backend_with(media), "a.mp4");
        handle.open()?;

        assert_eq!(handle.duration(), 300_300);
        assert_eq!(handle.frame_count(), 300);
        assert_eq!(handle.frame_duration(), 1001);
        Ok(())
    }

    #[test]
    fn test_open_fails_without_usable_timing() {
        let media = SyntheticMedia::default()
            .with_stream_metadata(false)
            .with_avg_frame_rate(Rational::new(0, 1));
        let mut handle = MediaHandle::new(backend_with(media), "a.mp4");
        assert!(handle.open().is_err());
        assert!(!handle.is_open());
    }

    #[test]
    fn test_open_rejects_invalid_time_base() {
        let media = SyntheticMedia::default().with_video_time_base(Rational::new(1, 0));
        let mut handle = MediaHandle::new(backend_with(media), "a.mp4");
        assert!(matches!(handle.open(), Err(Error::InvalidTimeBase(_))));
    }

    #[test]
    fn test_seek_requires_open_handle() -> Result<()> {
        let mut handle = MediaHandle::new(backend_with(SyntheticMedia::default()), "a.mp4");
        assert!(matches!(handle.seek(0), Err(Error::NotOpen(_))));

        handle.open()?;
        handle.seek(20_020)?;
        assert_eq!(handle.seek_pts(), 20_020);
        assert_eq!(handle.curr_pts(), 20_020);
        assert!(handle.seek(-1).is_err());
        Ok(())
    }

    #[test]
    fn test_close_and_reopen() -> Result<()> {
        let mut handle = MediaHandle::new(backend_with(SyntheticMedia::default()), "a.mp4");
        handle.open()?;
        handle.close();
        assert!(!handle.is_open());
        assert_eq!(handle.frame_duration(), 1001);
        assert!(handle.video_params().is_err());

        handle.open()?;
        assert!(handle.is_open());
        assert_eq!(handle.video_params()?.width, 1920);
        Ok(())
    }

    #[test]
    fn test_frame_conversions() -> Result<()> {
        let handle = MediaHandle::open_shared(backend_with(SyntheticMedia::default()), "a.mp4")?;
        let handle = handle.borrow();

        assert_eq!(handle.pts_for_frame_index(20), 20_020);
        assert_eq!(handle.frame_index_for_pts(20_020), 20);
        assert_eq!(handle.frame_index_for_pts(20_999), 20);
        assert_eq!(handle.audio_pts_for_video_pts(30_000), Some(48_000));
        Ok(())
    }

    #[test]
    fn test_audio_conversion_without_audio() -> Result<()> {
        let media = SyntheticMedia::default().without_audio();
        let handle = MediaHandle::open_shared(backend_with(media), "a.mp4")?;
        let handle = handle.borrow();

        assert!(!handle.has_audio());
        assert_eq!(handle.audio_pts_for_video_pts(30_000), None);
        assert!(handle.audio_params()?.is_none());
        Ok(())
    }
}
