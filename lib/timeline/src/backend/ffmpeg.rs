//! libav* backend through `ffmpeg-next`.

use super::{
    Backend, CodecParams, Decoder, Demuxer, Encoder, EncoderStream, Frame, FramePayload,
    MediaKind, Muxer, OutputParts, Packet, PacketPayload, ProbeInfo, Pull, Push, StreamInfo,
};
use crate::output::{AudioOutParams, CodecChoice, OutputParams, VideoOutParams};
use crate::{Error, Rational, Result};
use ffmpeg_next::{
    self as ffmpeg, channel_layout::ChannelLayout, codec, decoder, encoder, format, frame, media,
    picture,
};
use std::path::Path;

const AV_TIME_BASE: f64 = 1_000_000.0;

fn to_rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

fn to_ffmpeg_rational(r: Rational) -> ffmpeg::Rational {
    ffmpeg::Rational::new(r.num, r.den)
}

fn is_again(e: &ffmpeg::Error) -> bool {
    matches!(e, ffmpeg::Error::Other { errno } if *errno == ffmpeg::error::EAGAIN)
}

fn kind_of(medium: media::Type) -> Option<MediaKind> {
    match medium {
        media::Type::Video => Some(MediaKind::Video),
        media::Type::Audio => Some(MediaKind::Audio),
        _ => None,
    }
}

fn wrap_packet(packet: ffmpeg::Packet) -> Packet {
    Packet {
        stream_index: packet.stream(),
        kind: None,
        pts: packet.pts(),
        dts: packet.dts(),
        duration: packet.duration(),
        key: packet.is_key(),
        payload: PacketPayload::Ffmpeg(packet),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Result<Self> {
        ffmpeg::init().map_err(|e| Error::Backend(format!("Failed to initialize FFmpeg: {e}")))?;
        Ok(Self)
    }
}

impl Backend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open_input(&self, path: &Path) -> Result<Box<dyn Demuxer>> {
        let input = format::input(&path)
            .map_err(|e| Error::Backend(format!("Failed to open {}: {e}", path.display())))?;

        let streams = input
            .streams()
            .map(|stream| StreamInfo {
                index: stream.index(),
                kind: kind_of(stream.parameters().medium()),
                time_base: to_rational(stream.time_base()),
                duration: stream.duration(),
                frame_count: stream.frames(),
                avg_frame_rate: to_rational(stream.avg_frame_rate()),
            })
            .collect();

        let probe = ProbeInfo {
            streams,
            best_video: input.streams().best(media::Type::Video).map(|s| s.index()),
            best_audio: input.streams().best(media::Type::Audio).map(|s| s.index()),
            container_duration_secs: input.duration() as f64 / AV_TIME_BASE,
            modified: std::fs::metadata(path).and_then(|m| m.modified()).ok(),
        };

        log::debug!(
            "probed {}: {} streams, {:.3}s",
            path.display(),
            probe.streams.len(),
            probe.container_duration_secs
        );
        Ok(Box::new(FfmpegDemuxer { input, probe }))
    }

    fn create_output(&self, params: &OutputParams) -> Result<OutputParts> {
        let mut output = format::output(&params.path)
            .or_else(|e| {
                log::warn!(
                    "no container for {} ({e}), falling back to mp4",
                    params.path.display()
                );
                format::output_as(&params.path, "mp4")
            })
            .map_err(|e| {
                Error::Backend(format!("Failed to create {}: {e}", params.path.display()))
            })?;

        let global_header = output
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let video = add_video_stream(&mut output, &params.path, &params.video, global_header)?;
        let audio = params
            .audio
            .as_ref()
            .map(|audio| add_audio_stream(&mut output, &params.path, audio, global_header))
            .transpose()?;

        output
            .write_header()
            .map_err(|e| Error::Backend(format!("Failed to write header: {e}")))?;

        // The muxer may change stream time bases while writing the header
        let stream_time_base = |index: usize| -> Result<Rational> {
            output
                .stream(index)
                .map(|stream| to_rational(stream.time_base()))
                .ok_or_else(|| Error::Backend(format!("Output stream {index} disappeared")))
        };

        let video = EncoderStream {
            stream_time_base: stream_time_base(video.1)?,
            stream_index: video.1,
            encoder: Box::new(video.0),
        };
        let audio = match audio {
            Some((encoder, index)) => Some(EncoderStream {
                stream_time_base: stream_time_base(index)?,
                stream_index: index,
                encoder: Box::new(encoder),
            }),
            None => None,
        };

        Ok(OutputParts {
            muxer: Box::new(FfmpegMuxer { output }),
            video,
            audio,
        })
    }
}

fn find_encoder(
    output: &format::context::Output,
    path: &Path,
    choice: &CodecChoice,
    medium: media::Type,
) -> Result<ffmpeg::Codec> {
    let codec = match choice {
        CodecChoice::Auto => encoder::find(output.format().codec(&path, medium)),
        CodecChoice::Named(name) => encoder::find_by_name(name),
    };
    codec.ok_or_else(|| Error::Backend(format!("{choice} {medium:?} encoder not found")))
}

fn add_video_stream(
    output: &mut format::context::Output,
    path: &Path,
    params: &VideoOutParams,
    global_header: bool,
) -> Result<(FfmpegEncoder, usize)> {
    let codec = find_encoder(output, path, &params.codec, media::Type::Video)?;
    let pixel = params
        .pixel_format
        .parse::<format::Pixel>()
        .map_err(|_| Error::InvalidConfig(format!("unknown pixel format {}", params.pixel_format)))?;

    let mut video = codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()
        .map_err(|e| Error::Backend(format!("Failed to get video encoder: {e}")))?;

    video.set_width(params.width);
    video.set_height(params.height);
    video.set_format(pixel);
    video.set_time_base(to_ffmpeg_rational(params.time_base));
    video.set_frame_rate(Some(ffmpeg::Rational::from(params.fps)));
    if let Some(bit_rate) = params.bit_rate {
        video.set_bit_rate(bit_rate);
    }
    if global_header {
        video.set_flags(codec::flag::Flags::GLOBAL_HEADER);
    }

    let video = video
        .open_as(codec)
        .map_err(|e| Error::Backend(format!("Failed to open video encoder: {e}")))?;

    let mut stream = output
        .add_stream(codec)
        .map_err(|e| Error::Backend(format!("Failed to add video stream: {e}")))?;
    stream.set_parameters(&video);

    log::debug!(
        "video stream {} uses {} at {}x{} {}",
        stream.index(),
        codec.name(),
        params.width,
        params.height,
        params.pixel_format
    );

    let time_base = to_rational(video.time_base());
    Ok((
        FfmpegEncoder {
            time_base,
            codec: EncoderCodec::Video(video),
        },
        stream.index(),
    ))
}

fn add_audio_stream(
    output: &mut format::context::Output,
    path: &Path,
    params: &AudioOutParams,
    global_header: bool,
) -> Result<(FfmpegEncoder, usize)> {
    let codec = find_encoder(output, path, &params.codec, media::Type::Audio)?;

    let mut audio = codec::context::Context::new_with_codec(codec)
        .encoder()
        .audio()
        .map_err(|e| Error::Backend(format!("Failed to get audio encoder: {e}")))?;

    audio.set_rate(params.sample_rate as i32);
    audio.set_format(format::Sample::from(params.sample_format.as_str()));
    audio.set_channel_layout(if params.channels >= 2 {
        ChannelLayout::STEREO
    } else {
        ChannelLayout::MONO
    });
    audio.set_time_base(to_ffmpeg_rational(params.time_base));
    if let Some(bit_rate) = params.bit_rate {
        audio.set_bit_rate(bit_rate);
    }
    if global_header {
        audio.set_flags(codec::flag::Flags::GLOBAL_HEADER);
    }

    let audio = audio
        .open_as(codec)
        .map_err(|e| Error::Backend(format!("Failed to open audio encoder: {e}")))?;

    let mut stream = output
        .add_stream(codec)
        .map_err(|e| Error::Backend(format!("Failed to add audio stream: {e}")))?;
    stream.set_parameters(&audio);

    log::debug!(
        "audio stream {} uses {} at {} Hz x {}",
        stream.index(),
        codec.name(),
        params.sample_rate,
        params.channels
    );

    let time_base = to_rational(audio.time_base());
    Ok((
        FfmpegEncoder {
            time_base,
            codec: EncoderCodec::Audio(audio),
        },
        stream.index(),
    ))
}

struct FfmpegDemuxer {
    input: format::context::Input,
    probe: ProbeInfo,
}

impl Demuxer for FfmpegDemuxer {
    fn probe(&self) -> &ProbeInfo {
        &self.probe
    }

    fn seek(&mut self, stream: usize, ts: i64) -> Result<()> {
        // SAFETY: `input` owns a valid format context for as long as this demuxer lives
        let ret = unsafe {
            ffmpeg::sys::av_seek_frame(
                self.input.as_mut_ptr(),
                stream as i32,
                ts,
                ffmpeg::sys::AVSEEK_FLAG_BACKWARD as i32,
            )
        };

        if ret < 0 {
            return Err(Error::Backend(format!(
                "Failed to seek stream {stream} to {ts}: {}",
                ffmpeg::Error::from(ret)
            )));
        }
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(Some(wrap_packet(packet))),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(Error::Backend(format!("Failed to read packet: {e}"))),
        }
    }

    fn open_decoder(&mut self, stream: usize) -> Result<Box<dyn Decoder>> {
        let parameters = self
            .input
            .stream(stream)
            .ok_or_else(|| Error::Backend(format!("No stream {stream}")))?
            .parameters();
        let medium = parameters.medium();

        let context = codec::context::Context::from_parameters(parameters)
            .map_err(|e| Error::Backend(format!("Failed to create decoder context: {e}")))?;
        let codec_name = context
            .codec()
            .map(|c| c.name().to_string())
            .unwrap_or_default();

        let decoder = match medium {
            media::Type::Video => {
                let video = context
                    .decoder()
                    .video()
                    .map_err(|e| Error::Backend(format!("Failed to create video decoder: {e}")))?;
                let params = CodecParams {
                    codec_name,
                    width: video.width(),
                    height: video.height(),
                    pixel_format: video
                        .format()
                        .descriptor()
                        .map(|d| d.name().to_string())
                        .unwrap_or_default(),
                    bit_rate: video.bit_rate(),
                    ..Default::default()
                };
                FfmpegDecoder {
                    params,
                    codec: DecoderCodec::Video(video),
                }
            }
            media::Type::Audio => {
                let audio = context
                    .decoder()
                    .audio()
                    .map_err(|e| Error::Backend(format!("Failed to create audio decoder: {e}")))?;
                let params = CodecParams {
                    codec_name,
                    sample_rate: audio.rate(),
                    sample_format: audio.format().name().to_string(),
                    channels: audio.channels() as u16,
                    bit_rate: audio.bit_rate(),
                    ..Default::default()
                };
                FfmpegDecoder {
                    params,
                    codec: DecoderCodec::Audio(audio),
                }
            }
            other => {
                return Err(Error::Backend(format!(
                    "Stream {stream} is {other:?}, not audio or video"
                )));
            }
        };

        Ok(Box::new(decoder))
    }
}

enum DecoderCodec {
    Video(decoder::Video),
    Audio(decoder::Audio),
}

struct FfmpegDecoder {
    params: CodecParams,
    codec: DecoderCodec,
}

impl FfmpegDecoder {
    fn opened(&mut self) -> &mut decoder::Opened {
        match &mut self.codec {
            DecoderCodec::Video(video) => video,
            DecoderCodec::Audio(audio) => audio,
        }
    }
}

impl Decoder for FfmpegDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<Push> {
        let PacketPayload::Ffmpeg(inner) = &packet.payload else {
            return Err(Error::Backend("FFmpeg decoder fed a foreign packet".to_string()));
        };

        match self.opened().send_packet(inner) {
            Ok(()) => Ok(Push::Accepted),
            Err(e) if is_again(&e) => Ok(Push::Full),
            Err(e) => Err(Error::Backend(format!("Decoder send failed: {e}"))),
        }
    }

    fn receive_frame(&mut self) -> Result<Pull<Frame>> {
        let received = match &mut self.codec {
            DecoderCodec::Video(video) => {
                let mut decoded = frame::Video::empty();
                video.receive_frame(&mut decoded).map(|()| Frame {
                    kind: MediaKind::Video,
                    pts: decoded.timestamp().or(decoded.pts()),
                    key_frame: decoded.is_key(),
                    payload: FramePayload::Video(decoded),
                })
            }
            DecoderCodec::Audio(audio) => {
                let mut decoded = frame::Audio::empty();
                audio.receive_frame(&mut decoded).map(|()| Frame {
                    kind: MediaKind::Audio,
                    pts: decoded.timestamp().or(decoded.pts()),
                    key_frame: true,
                    payload: FramePayload::Audio(decoded),
                })
            }
        };

        match received {
            Ok(frame) => Ok(Pull::Ready(frame)),
            Err(e) if is_again(&e) => Ok(Pull::NeedsInput),
            Err(ffmpeg::Error::Eof) => Ok(Pull::Finished),
            Err(e) => Err(Error::Backend(format!("Decoder receive failed: {e}"))),
        }
    }

    fn flush(&mut self) {
        self.opened().flush();
    }

    fn parameters(&self) -> CodecParams {
        self.params.clone()
    }
}

enum EncoderCodec {
    Video(encoder::Video),
    Audio(encoder::Audio),
}

struct FfmpegEncoder {
    time_base: Rational,
    codec: EncoderCodec,
}

impl FfmpegEncoder {
    fn opened(&mut self) -> &mut encoder::Encoder {
        match &mut self.codec {
            EncoderCodec::Video(video) => video,
            EncoderCodec::Audio(audio) => audio,
        }
    }
}

impl Encoder for FfmpegEncoder {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn send_frame(&mut self, frame: Option<&mut Frame>) -> Result<Push> {
        let sent = match frame {
            None => self.opened().send_eof(),
            Some(frame) => {
                let pts = frame.pts;
                let key = frame.key_frame;
                match (&mut self.codec, &mut frame.payload) {
                    (EncoderCodec::Video(encoder), FramePayload::Video(video)) => {
                        video.set_pts(pts);
                        video.set_kind(if key {
                            picture::Type::I
                        } else {
                            picture::Type::None
                        });
                        encoder.send_frame(video)
                    }
                    (EncoderCodec::Audio(encoder), FramePayload::Audio(audio)) => {
                        audio.set_pts(pts);
                        encoder.send_frame(audio)
                    }
                    _ => {
                        return Err(Error::Backend(format!(
                            "FFmpeg encoder fed a foreign {} frame",
                            frame.kind
                        )));
                    }
                }
            }
        };

        match sent {
            Ok(()) => Ok(Push::Accepted),
            Err(e) if is_again(&e) => Ok(Push::Full),
            Err(e) => Err(Error::Backend(format!("Encoder send failed: {e}"))),
        }
    }

    fn receive_packet(&mut self) -> Result<Pull<Packet>> {
        let mut packet = ffmpeg::Packet::empty();
        match self.opened().receive_packet(&mut packet) {
            Ok(()) => Ok(Pull::Ready(wrap_packet(packet))),
            Err(e) if is_again(&e) => Ok(Pull::NeedsInput),
            Err(ffmpeg::Error::Eof) => Ok(Pull::Finished),
            Err(e) => Err(Error::Backend(format!("Encoder receive failed: {e}"))),
        }
    }
}

struct FfmpegMuxer {
    output: format::context::Output,
}

impl Muxer for FfmpegMuxer {
    fn write_packet(&mut self, packet: Packet) -> Result<()> {
        let PacketPayload::Ffmpeg(mut inner) = packet.payload else {
            return Err(Error::Backend("FFmpeg muxer fed a foreign packet".to_string()));
        };

        inner.set_stream(packet.stream_index);
        inner.set_pts(packet.pts);
        inner.set_dts(packet.dts);
        inner.set_duration(packet.duration);
        inner
            .write_interleaved(&mut self.output)
            .map_err(|e| Error::Backend(format!("Failed to write packet: {e}")))
    }

    fn write_trailer(&mut self) -> Result<()> {
        self.output
            .write_trailer()
            .map_err(|e| Error::Backend(format!("Failed to write trailer: {e}")))
    }
}
