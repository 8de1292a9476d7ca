//! Encoding: decoded frames in, muxable packets out.
//!
//! Video and audio each run their own send/receive state machine. They share the kind of the last
//! frame sent, which decides which encoder is drained first. Once the source completes a full pass
//! both encoders are flushed and drained in turn.

use crate::backend::{Frame, MediaKind, Packet, Pull, Push};
use crate::clip::{Clip, ClipOutcome};
use crate::output::OutputContext;
use crate::sequence::{Sequence, SequenceOutcome};
use crate::{Error, Rational, Result, rational};

// Steps allowed for one packet before the encoders are considered stuck
const MAX_STEPS: usize = 4096;

#[derive(Debug)]
pub enum SourceFrame {
    Frame(Frame),
    /// The source finished a full pass.
    End,
}

/// Something that yields decoded frames for an [`OutputContext`].
pub trait FrameSource {
    /// Time base of the video frames this source yields.
    fn video_time_base(&self) -> Rational;
    fn audio_time_base(&self) -> Rational;
    fn next_frame(&mut self) -> Result<SourceFrame>;
}

impl FrameSource for Sequence {
    fn video_time_base(&self) -> Rational {
        Sequence::video_time_base(self)
    }

    fn audio_time_base(&self) -> Rational {
        Sequence::audio_time_base(self)
    }

    fn next_frame(&mut self) -> Result<SourceFrame> {
        Ok(match self.read_frame()? {
            SequenceOutcome::Ready(frame) => SourceFrame::Frame(frame),
            SequenceOutcome::EndOfSequence => SourceFrame::End,
        })
    }
}

/// A lone clip yields frames relative to its own start.
impl FrameSource for Clip {
    fn video_time_base(&self) -> Rational {
        Clip::video_time_base(self)
    }

    fn audio_time_base(&self) -> Rational {
        Clip::audio_time_base(self)
    }

    fn next_frame(&mut self) -> Result<SourceFrame> {
        let mut frame = match self.read_frame()? {
            ClipOutcome::Ready(frame) => frame,
            ClipOutcome::EndOfClip => return Ok(SourceFrame::End),
        };

        match frame.kind {
            MediaKind::Video => {
                frame.pts = frame.pts.map(|pts| self.video_relative_ts(pts));
                if self.frame_index() == 1 {
                    frame.key_frame = true;
                }
            }
            MediaKind::Audio => frame.pts = frame.pts.map(|pts| self.audio_relative_ts(pts)),
        }
        Ok(SourceFrame::Frame(frame))
    }
}

#[derive(Debug)]
pub enum EncodeOutcome {
    /// Ready for [`OutputContext::write_packet`]: stream index set, timestamps in the stream's
    /// time base.
    Packet(Packet),
    /// Both encoders are drained.
    EndOfStream,
}

impl OutputContext {
    /// Produce the next encoded packet, pulling frames from `source` as the encoders need them.
    pub fn encode_frame<S: FrameSource + ?Sized>(&mut self, source: &mut S) -> Result<EncodeOutcome> {
        for _ in 0..MAX_STEPS {
            if self.all_flushed() {
                return Ok(EncodeOutcome::EndOfStream);
            }

            if let Some(kind) = self.receive_target() {
                if let Some(packet) = self.receive_packet(kind)? {
                    return Ok(EncodeOutcome::Packet(packet));
                }
                if self.is_flushing() {
                    continue;
                }
            }

            if self.resend_pending()? {
                continue;
            }

            match source.next_frame()? {
                SourceFrame::Frame(frame) => self.send_frame(source, frame)?,
                SourceFrame::End => self.start_flush()?,
            }
        }

        Err(Error::Backend(format!(
            "encoders for {} made no progress in {MAX_STEPS} steps",
            self.params().path.display()
        )))
    }

    fn all_flushed(&self) -> bool {
        self.video.done_flush && self.audio.as_ref().is_none_or(|audio| audio.done_flush)
    }

    fn is_flushing(&self) -> bool {
        self.video.flushing
    }

    /// Encoder to drain next: the one being flushed, or the one that took the last frame.
    fn receive_target(&self) -> Option<MediaKind> {
        if self.is_flushing() {
            return [MediaKind::Video, MediaKind::Audio]
                .into_iter()
                .find(|kind| self.stream(*kind).is_some_and(|s| !s.done_flush));
        }
        self.last_sent
    }

    /// One stamped packet from the `kind` encoder, `None` when it has nothing to give.
    fn receive_packet(&mut self, kind: MediaKind) -> Result<Option<Packet>> {
        let Some(stream) = self.stream_mut(kind) else {
            return Ok(None);
        };

        match stream.encoder.receive_packet()? {
            Pull::Ready(packet) => Ok(Some(stream.stamp(packet))),
            Pull::NeedsInput if stream.flush_pending => {
                stream.flush_pending = stream.encoder.send_frame(None)? == Push::Full;
                if !stream.flush_pending {
                    log::debug!("{kind} encoder took the flush signal on retry");
                }
                Ok(None)
            }
            Pull::NeedsInput if stream.flushing => {
                log::warn!("{kind} encoder asked for input while flushing, treating it as drained");
                stream.done_flush = true;
                Ok(None)
            }
            Pull::NeedsInput => Ok(None),
            Pull::Finished => {
                log::debug!("{kind} encoder flushed");
                stream.done_flush = true;
                Ok(None)
            }
        }
    }

    /// Offer a held frame to its encoder again. True when there was one.
    fn resend_pending(&mut self) -> Result<bool> {
        for kind in [MediaKind::Video, MediaKind::Audio] {
            let Some(stream) = self.stream_mut(kind) else {
                continue;
            };
            let Some(mut frame) = stream.pending.take() else {
                continue;
            };

            if stream.encoder.send_frame(Some(&mut frame))? == Push::Full {
                stream.pending = Some(frame);
            }
            self.last_sent = Some(kind);
            return Ok(true);
        }
        Ok(false)
    }

    fn send_frame<S: FrameSource + ?Sized>(&mut self, source: &S, mut frame: Frame) -> Result<()> {
        let kind = frame.kind;
        let from = match kind {
            MediaKind::Video => source.video_time_base(),
            MediaKind::Audio => source.audio_time_base(),
        };

        let Some(stream) = self.stream_mut(kind) else {
            log::trace!("no {kind} stream in output, dropping frame {:?}", frame.pts);
            return Ok(());
        };

        let to = stream.encoder.time_base();
        if from != to {
            frame.pts = frame.pts.map(|pts| rational::convert(pts, from, to));
        }

        if stream.encoder.send_frame(Some(&mut frame))? == Push::Full {
            log::trace!("{kind} encoder full, holding frame {:?}", frame.pts);
            stream.pending = Some(frame);
        }
        self.last_sent = Some(kind);
        Ok(())
    }

    fn start_flush(&mut self) -> Result<()> {
        log::debug!("source exhausted, flushing encoders");
        for kind in [MediaKind::Video, MediaKind::Audio] {
            if let Some(stream) = self.stream_mut(kind) {
                if stream.encoder.send_frame(None)? == Push::Full {
                    log::debug!("{kind} encoder full, holding the flush signal");
                    stream.flush_pending = true;
                }
                stream.flushing = true;
            }
        }
        Ok(())
    }

    /// Encode one full pass of `source` and write every packet. Returns the packets written.
    fn write_all<S: FrameSource + ?Sized>(&mut self, source: &mut S) -> Result<usize> {
        let mut written = 0;
        loop {
            match self.encode_frame(source)? {
                EncodeOutcome::Packet(packet) => {
                    self.write_packet(packet)?;
                    written += 1;
                }
                EncodeOutcome::EndOfStream => return Ok(written),
            }
        }
    }

    /// Encode `sequence` from its first frame, closing clips as they run out, and finish the file.
    pub fn write_sequence(&mut self, sequence: &mut Sequence) -> Result<usize> {
        if !sequence.is_empty() {
            sequence.seek(0)?;
        }

        let close_clips = sequence.close_clips();
        sequence.set_close_clips(true);
        let written = self.write_all(sequence);
        sequence.set_close_clips(close_clips);

        let written = written?;
        self.finish()?;
        Ok(written)
    }

    /// Encode a single clip from its start and finish the file.
    pub fn write_clip(&mut self, clip: &mut Clip) -> Result<usize> {
        clip.open()?;
        clip.reset()?;

        let written = self.write_all(clip)?;
        self.finish()?;
        Ok(written)
    }
}
