//! Frame decoding for a single clip.
//!
//! The handle remembers which decoder received the last packet. That decoder is drained first;
//! when it asks for more input the next packet of the clip is routed to its own decoder.

use crate::backend::{Frame, MediaKind, Pull, Push};
use crate::clip::{Clip, ClipOutcome};
use crate::media::DecoderStream;
use crate::Result;

impl Clip {
    /// Decode the next frame inside the bound.
    ///
    /// Frames that precede the handle's seek position are decoded and dropped, which turns the
    /// keyframe aligned seek into a frame accurate one.
    pub fn read_frame(&mut self) -> Result<ClipOutcome<Frame>> {
        self.open()?;

        loop {
            let stream = self.handle.borrow().last_decoder_stream();
            let kind = match stream {
                DecoderStream::Video => MediaKind::Video,
                DecoderStream::Audio => MediaKind::Audio,
                DecoderStream::None => {
                    if !self.send_next_packet()? {
                        self.frame_index = 0;
                        return Ok(ClipOutcome::EndOfClip);
                    }
                    continue;
                }
            };

            let pulled = self.handle.borrow_mut().receive_frame(kind)?;
            match pulled {
                Pull::Ready(frame) => {
                    let seek_pts = self.handle_seek_pts(kind);
                    if frame.pts.is_some_and(|pts| pts < seek_pts) {
                        log::trace!("clip {} drops {kind} frame {:?} before {seek_pts}", self.id, frame.pts);
                        continue;
                    }

                    if kind == MediaKind::Video {
                        self.frame_index += 1;
                    }
                    return Ok(ClipOutcome::Ready(frame));
                }
                Pull::NeedsInput | Pull::Finished => {
                    if !self.send_next_packet()? {
                        self.frame_index = 0;
                        return Ok(ClipOutcome::EndOfClip);
                    }
                }
            }
        }
    }

    /// Route the next packet of the clip to its decoder. False once the clip is exhausted.
    fn send_next_packet(&mut self) -> Result<bool> {
        let stalled = self.handle.borrow_mut().take_stalled_packet();
        let packet = match stalled {
            Some(packet) => packet,
            None => match self.read_packet()? {
                ClipOutcome::Ready(packet) => packet,
                ClipOutcome::EndOfClip => {
                    self.handle
                        .borrow_mut()
                        .set_last_decoder_stream(DecoderStream::None);
                    return Ok(false);
                }
            },
        };

        let Some(kind) = packet.kind else {
            return Ok(true);
        };

        let mut handle = self.handle.borrow_mut();
        match handle.send_packet(kind, &packet)? {
            Push::Accepted => handle.set_last_decoder_stream(kind.into()),
            Push::Full => {
                handle.set_last_decoder_stream(kind.into());
                handle.stall_packet(packet);
            }
        }
        Ok(true)
    }
}
