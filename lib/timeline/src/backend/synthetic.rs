//! Deterministic in-memory backend.
//!
//! Sources are registered by path and produce one packet per video frame plus fixed-size audio
//! packets, interleaved in presentation order. Decoders emit one frame per packet, encoders hold
//! back a configurable number of packets until flushed, and the muxer records what it was given.

use super::{
    Backend, CodecParams, Decoder, Demuxer, Encoder, EncoderStream, Frame, FramePayload,
    MediaKind, Muxer, OutputParts, Packet, PacketPayload, ProbeInfo, Pull, Push, StreamInfo,
};
use crate::{Error, Rational, Result, output::OutputParams, rational};
use derivative::Derivative;
use derive_setters::Setters;
use std::{
    cell::RefCell,
    cmp::Ordering,
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    rc::Rc,
    time::SystemTime,
};

const VIDEO_STREAM: usize = 0;
const AUDIO_STREAM: usize = 1;

/// Standard 90kHz timescale used for muxed video streams
pub const VIDEO_TIMESCALE: i32 = 90000;

#[derive(Debug, Clone, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
#[non_exhaustive]
pub struct SyntheticAudio {
    #[derivative(Default(value = "Rational::new(1, 48000)"))]
    pub time_base: Rational,
    /// Packet length in `time_base` units
    #[derivative(Default(value = "1024"))]
    pub packet_duration: i64,
    #[derivative(Default(value = "48000"))]
    pub sample_rate: u32,
    #[derivative(Default(value = "2"))]
    pub channels: u16,
    #[derivative(Default(value = "\"fltp\".to_string()"))]
    pub sample_format: String,
}

/// Description of one fake source file.
#[derive(Debug, Clone, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
#[non_exhaustive]
pub struct SyntheticMedia {
    #[derivative(Default(value = "Rational::new(1, 30000)"))]
    pub video_time_base: Rational,
    #[derivative(Default(value = "1001"))]
    pub frame_duration: i64,
    #[derivative(Default(value = "300"))]
    pub frame_count: i64,
    /// Distance between keyframes, in frames
    #[derivative(Default(value = "12"))]
    pub gop_size: i64,
    #[derivative(Default(value = "Rational::new(30000, 1001)"))]
    pub avg_frame_rate: Rational,
    #[derivative(Default(value = "1920"))]
    pub width: u32,
    #[derivative(Default(value = "1080"))]
    pub height: u32,
    #[derivative(Default(value = "\"yuv420p\".to_string()"))]
    pub pixel_format: String,
    #[derivative(Default(value = "Some(SyntheticAudio::default())"))]
    pub audio: Option<SyntheticAudio>,
    /// When false the video stream reports no duration or frame count.
    #[derivative(Default(value = "true"))]
    pub stream_metadata: bool,
    #[derivative(Default(value = "None"))]
    pub modified: Option<SystemTime>,
}

impl SyntheticMedia {
    pub fn without_audio(self) -> Self {
        self.with_audio(None)
    }

    fn video_duration(&self) -> i64 {
        self.frame_count * self.frame_duration
    }

    fn audio_duration(&self, audio: &SyntheticAudio) -> i64 {
        rational::convert(self.video_duration(), self.video_time_base, audio.time_base)
    }
}

/// A packet as it reached the synthetic muxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxedPacket {
    pub stream_index: usize,
    pub kind: Option<MediaKind>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub key: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MuxedOutput {
    pub header_written: bool,
    pub trailer_written: bool,
    pub video_time_base: Rational,
    pub audio_time_base: Option<Rational>,
    pub packets: Vec<MuxedPacket>,
}

impl MuxedOutput {
    pub fn packets_of(&self, kind: MediaKind) -> impl Iterator<Item = &MuxedPacket> {
        self.packets.iter().filter(move |p| p.kind == Some(kind))
    }
}

#[derive(Debug)]
pub struct SyntheticBackend {
    media: RefCell<HashMap<PathBuf, SyntheticMedia>>,
    opened: RefCell<HashMap<PathBuf, usize>>,
    outputs: RefCell<HashMap<PathBuf, Rc<RefCell<MuxedOutput>>>>,
    encoder_delay: usize,
    output_video_time_base: Rational,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self {
            media: RefCell::new(HashMap::new()),
            opened: RefCell::new(HashMap::new()),
            outputs: RefCell::new(HashMap::new()),
            encoder_delay: 2,
            output_video_time_base: Rational::new(1, VIDEO_TIMESCALE),
        }
    }
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets each encoder holds back until it is flushed.
    pub fn with_encoder_delay(mut self, delay: usize) -> Self {
        self.encoder_delay = delay;
        self
    }

    pub fn with_output_video_time_base(mut self, time_base: Rational) -> Self {
        self.output_video_time_base = time_base;
        self
    }

    pub fn register(&self, path: impl Into<PathBuf>, media: SyntheticMedia) {
        self.media.borrow_mut().insert(path.into(), media);
    }

    /// How many times `path` has been opened.
    pub fn open_count(&self, path: impl AsRef<Path>) -> usize {
        self.opened
            .borrow()
            .get(path.as_ref())
            .copied()
            .unwrap_or_default()
    }

    /// Snapshot of what was muxed into `path`.
    pub fn output(&self, path: impl AsRef<Path>) -> Option<MuxedOutput> {
        self.outputs
            .borrow()
            .get(path.as_ref())
            .map(|output| output.borrow().clone())
    }
}

impl Backend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open_input(&self, path: &Path) -> Result<Box<dyn Demuxer>> {
        let media = self
            .media
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("No such source: {}", path.display())))?;

        *self.opened.borrow_mut().entry(path.to_path_buf()).or_default() += 1;
        log::trace!("synthetic open {}", path.display());

        Ok(Box::new(SyntheticDemuxer::new(media)))
    }

    fn create_output(&self, params: &OutputParams) -> Result<OutputParts> {
        params.video.time_base.validate()?;
        if let Some(audio) = &params.audio {
            audio.time_base.validate()?;
        }

        let audio_stream_time_base = params
            .audio
            .as_ref()
            .map(|audio| Rational::new(1, audio.sample_rate as i32));

        let record = Rc::new(RefCell::new(MuxedOutput {
            header_written: true,
            video_time_base: self.output_video_time_base,
            audio_time_base: audio_stream_time_base,
            ..Default::default()
        }));
        self.outputs
            .borrow_mut()
            .insert(params.path.clone(), record.clone());

        let video = EncoderStream {
            encoder: Box::new(SyntheticEncoder::new(
                MediaKind::Video,
                params.video.time_base,
                self.encoder_delay,
            )),
            stream_index: VIDEO_STREAM,
            stream_time_base: self.output_video_time_base,
        };

        let audio = params.audio.as_ref().zip(audio_stream_time_base).map(
            |(audio, stream_time_base)| EncoderStream {
                encoder: Box::new(SyntheticEncoder::new(
                    MediaKind::Audio,
                    audio.time_base,
                    self.encoder_delay,
                )),
                stream_index: AUDIO_STREAM,
                stream_time_base,
            },
        );

        Ok(OutputParts {
            muxer: Box::new(SyntheticMuxer { record }),
            video,
            audio,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    stream: usize,
    pts: i64,
    duration: i64,
    key: bool,
}

struct SyntheticDemuxer {
    media: SyntheticMedia,
    probe: ProbeInfo,
    timeline: Vec<Entry>,
    cursor: usize,
}

impl SyntheticDemuxer {
    fn new(media: SyntheticMedia) -> Self {
        let timeline = Self::interleave(&media);
        let probe = Self::probe_info(&media);

        Self {
            media,
            probe,
            timeline,
            cursor: 0,
        }
    }

    fn probe_info(media: &SyntheticMedia) -> ProbeInfo {
        let (duration, frame_count) = if media.stream_metadata {
            (media.video_duration(), media.frame_count)
        } else {
            (0, 0)
        };

        let mut streams = vec![StreamInfo {
            index: VIDEO_STREAM,
            kind: Some(MediaKind::Video),
            time_base: media.video_time_base,
            duration,
            frame_count,
            avg_frame_rate: media.avg_frame_rate,
        }];

        if let Some(audio) = &media.audio {
            streams.push(StreamInfo {
                index: AUDIO_STREAM,
                kind: Some(MediaKind::Audio),
                time_base: audio.time_base,
                duration: media.audio_duration(audio),
                frame_count: 0,
                avg_frame_rate: Rational::new(0, 1),
            });
        }

        ProbeInfo {
            streams,
            best_video: Some(VIDEO_STREAM),
            best_audio: media.audio.as_ref().map(|_| AUDIO_STREAM),
            container_duration_secs: media.video_duration() as f64
                * media.video_time_base.as_f64(),
            modified: media.modified,
        }
    }

    /// Video and audio packets merged in presentation order, video first on ties.
    fn interleave(media: &SyntheticMedia) -> Vec<Entry> {
        let video = (0..media.frame_count).map(|i| Entry {
            stream: VIDEO_STREAM,
            pts: i * media.frame_duration,
            duration: media.frame_duration,
            key: media.gop_size <= 1 || i % media.gop_size == 0,
        });

        let Some(audio) = &media.audio else {
            return video.collect();
        };

        let audio_end = media.audio_duration(audio);
        let step = audio.packet_duration.max(1);
        let mut audio_entries = (0..)
            .map(|j| j * step)
            .take_while(|pts| *pts < audio_end)
            .map(|pts| Entry {
                stream: AUDIO_STREAM,
                pts,
                duration: step,
                key: true,
            })
            .peekable();

        let vtb = media.video_time_base;
        let atb = audio.time_base;
        let mut timeline = Vec::new();

        for v in video {
            while let Some(a) = audio_entries.peek() {
                if compare_time(a.pts, atb, v.pts, vtb) == Ordering::Less {
                    timeline.push(*a);
                    audio_entries.next();
                } else {
                    break;
                }
            }
            timeline.push(v);
        }
        timeline.extend(audio_entries);
        timeline
    }

    fn kind_of(stream: usize) -> Option<MediaKind> {
        match stream {
            VIDEO_STREAM => Some(MediaKind::Video),
            AUDIO_STREAM => Some(MediaKind::Audio),
            _ => None,
        }
    }
}

fn compare_time(a: i64, a_tb: Rational, b: i64, b_tb: Rational) -> Ordering {
    let lhs = i128::from(a) * i128::from(a_tb.num) * i128::from(b_tb.den);
    let rhs = i128::from(b) * i128::from(b_tb.num) * i128::from(a_tb.den);
    lhs.cmp(&rhs)
}

impl Demuxer for SyntheticDemuxer {
    fn probe(&self) -> &ProbeInfo {
        &self.probe
    }

    fn seek(&mut self, stream: usize, ts: i64) -> Result<()> {
        if Self::kind_of(stream).is_none() || self.probe.stream(stream).is_none() {
            return Err(Error::Backend(format!("Seek on unknown stream {stream}")));
        }

        let candidates = || {
            self.timeline
                .iter()
                .enumerate()
                .filter(|(_, e)| e.stream == stream && e.key)
        };

        let position = candidates()
            .filter(|(_, e)| e.pts <= ts)
            .last()
            .or_else(|| candidates().next())
            .map(|(i, _)| i)
            .unwrap_or(self.timeline.len());

        self.cursor = position;
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let Some(entry) = self.timeline.get(self.cursor).copied() else {
            return Ok(None);
        };
        self.cursor += 1;

        Ok(Some(Packet {
            stream_index: entry.stream,
            kind: Self::kind_of(entry.stream),
            pts: Some(entry.pts),
            dts: Some(entry.pts),
            duration: entry.duration,
            key: entry.key,
            payload: PacketPayload::Bytes(entry.pts.to_le_bytes().to_vec()),
        }))
    }

    fn open_decoder(&mut self, stream: usize) -> Result<Box<dyn Decoder>> {
        let kind = Self::kind_of(stream)
            .filter(|_| self.probe.stream(stream).is_some())
            .ok_or_else(|| Error::Backend(format!("No decodable stream {stream}")))?;

        let params = match (kind, &self.media.audio) {
            (MediaKind::Video, _) => CodecParams {
                codec_name: "synthetic-video".to_string(),
                width: self.media.width,
                height: self.media.height,
                pixel_format: self.media.pixel_format.clone(),
                ..Default::default()
            },
            (MediaKind::Audio, Some(audio)) => CodecParams {
                codec_name: "synthetic-audio".to_string(),
                sample_rate: audio.sample_rate,
                sample_format: audio.sample_format.clone(),
                channels: audio.channels,
                ..Default::default()
            },
            (MediaKind::Audio, None) => {
                return Err(Error::Backend("Source has no audio stream".to_string()));
            }
        };

        Ok(Box::new(SyntheticDecoder {
            kind,
            params,
            queue: VecDeque::new(),
        }))
    }
}

struct SyntheticDecoder {
    kind: MediaKind,
    params: CodecParams,
    queue: VecDeque<Frame>,
}

impl Decoder for SyntheticDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<Push> {
        if !self.queue.is_empty() {
            return Ok(Push::Full);
        }

        self.queue.push_back(Frame {
            kind: self.kind,
            pts: packet.pts,
            key_frame: packet.key,
            payload: FramePayload::Samples(packet.data().to_vec()),
        });
        Ok(Push::Accepted)
    }

    fn receive_frame(&mut self) -> Result<Pull<Frame>> {
        Ok(match self.queue.pop_front() {
            Some(frame) => Pull::Ready(frame),
            None => Pull::NeedsInput,
        })
    }

    fn flush(&mut self) {
        self.queue.clear();
    }

    fn parameters(&self) -> CodecParams {
        self.params.clone()
    }
}

struct SyntheticEncoder {
    kind: MediaKind,
    time_base: Rational,
    delay: usize,
    flushing: bool,
    queue: VecDeque<Packet>,
}

impl SyntheticEncoder {
    fn new(kind: MediaKind, time_base: Rational, delay: usize) -> Self {
        Self {
            kind,
            time_base,
            delay,
            flushing: false,
            queue: VecDeque::new(),
        }
    }
}

impl Encoder for SyntheticEncoder {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn send_frame(&mut self, frame: Option<&mut Frame>) -> Result<Push> {
        let Some(frame) = frame else {
            self.flushing = true;
            return Ok(Push::Accepted);
        };

        if self.flushing {
            return Err(Error::Backend(format!(
                "{} frame sent to an encoder that is flushing",
                self.kind
            )));
        }

        if self.queue.len() > self.delay {
            return Ok(Push::Full);
        }

        self.queue.push_back(Packet {
            stream_index: 0,
            kind: Some(self.kind),
            pts: frame.pts,
            dts: frame.pts,
            duration: 0,
            key: frame.key_frame,
            payload: PacketPayload::Bytes(frame.data().to_vec()),
        });
        Ok(Push::Accepted)
    }

    fn receive_packet(&mut self) -> Result<Pull<Packet>> {
        if self.flushing || self.queue.len() > self.delay {
            return Ok(match self.queue.pop_front() {
                Some(packet) => Pull::Ready(packet),
                None if self.flushing => Pull::Finished,
                None => Pull::NeedsInput,
            });
        }
        Ok(Pull::NeedsInput)
    }
}

struct SyntheticMuxer {
    record: Rc<RefCell<MuxedOutput>>,
}

impl Muxer for SyntheticMuxer {
    fn write_packet(&mut self, packet: Packet) -> Result<()> {
        let mut record = self.record.borrow_mut();
        if record.trailer_written {
            return Err(Error::Backend("Packet written after trailer".to_string()));
        }

        record.packets.push(MuxedPacket {
            stream_index: packet.stream_index,
            kind: packet.kind,
            pts: packet.pts,
            dts: packet.dts,
            key: packet.key,
        });
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        let mut record = self.record.borrow_mut();
        if record.trailer_written {
            return Err(Error::Backend("Trailer already written".to_string()));
        }
        record.trailer_written = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demuxer(media: SyntheticMedia) -> SyntheticDemuxer {
        SyntheticDemuxer::new(media)
    }

    #[test]
    fn test_interleave_order() {
        let media = SyntheticMedia::default().with_frame_count(10);
        let demuxer = demuxer(media);

        let video = demuxer.timeline.iter().filter(|e| e.stream == VIDEO_STREAM).count();
        let audio = demuxer.timeline.iter().filter(|e| e.stream == AUDIO_STREAM).count();
        assert_eq!(video, 10);
        // 10 frames of 1001/30000s at 48kHz is 16016 samples, 16 packets of 1024
        assert_eq!(audio, 16);

        let vtb = Rational::new(1, 30000);
        let atb = Rational::new(1, 48000);
        let tb = |e: &Entry| if e.stream == VIDEO_STREAM { vtb } else { atb };
        for pair in demuxer.timeline.windows(2) {
            assert_ne!(
                compare_time(pair[0].pts, tb(&pair[0]), pair[1].pts, tb(&pair[1])),
                Ordering::Greater
            );
        }
    }

    #[test]
    fn test_seek_lands_on_previous_keyframe() -> Result<()> {
        let mut demuxer = demuxer(SyntheticMedia::default().without_audio());

        demuxer.seek(VIDEO_STREAM, 20 * 1001)?;
        let packet = demuxer.read_packet()?.expect("packet after seek");
        assert_eq!(packet.pts, Some(12 * 1001));
        assert!(packet.key);

        demuxer.seek(VIDEO_STREAM, 24 * 1001)?;
        assert_eq!(demuxer.read_packet()?.and_then(|p| p.pts), Some(24 * 1001));

        demuxer.seek(VIDEO_STREAM, -5)?;
        assert_eq!(demuxer.read_packet()?.and_then(|p| p.pts), Some(0));

        assert!(demuxer.seek(AUDIO_STREAM, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_metadata() {
        let demuxer = demuxer(SyntheticMedia::default().with_stream_metadata(false));
        let video = demuxer.probe().stream(VIDEO_STREAM).cloned().expect("video stream");
        assert_eq!(video.duration, 0);
        assert_eq!(video.frame_count, 0);
        assert!((demuxer.probe().container_duration_secs - 10.01).abs() < 1e-9);
    }

    #[test]
    fn test_encoder_delay_and_flush() -> Result<()> {
        let mut encoder = SyntheticEncoder::new(MediaKind::Video, Rational::new(1, 30000), 2);

        for i in 0..3 {
            let mut frame = Frame::new(MediaKind::Video, Some(i), vec![]);
            assert_eq!(encoder.send_frame(Some(&mut frame))?, Push::Accepted);
        }

        assert!(matches!(encoder.receive_packet()?, Pull::Ready(p) if p.pts == Some(0)));
        assert!(matches!(encoder.receive_packet()?, Pull::NeedsInput));

        encoder.send_frame(None)?;
        assert!(matches!(encoder.receive_packet()?, Pull::Ready(p) if p.pts == Some(1)));
        assert!(matches!(encoder.receive_packet()?, Pull::Ready(p) if p.pts == Some(2)));
        assert!(matches!(encoder.receive_packet()?, Pull::Finished));
        Ok(())
    }

    #[test]
    fn test_unknown_source() {
        let backend = SyntheticBackend::new();
        assert!(backend.open_input(Path::new("missing.mp4")).is_err());
        assert_eq!(backend.open_count("missing.mp4"), 0);
    }
}
