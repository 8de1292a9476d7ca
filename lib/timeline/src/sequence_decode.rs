//! Frame decoding across a sequence.
//!
//! Frames leave this layer stamped in sequence time: video in the sequence video time base, audio
//! in the sequence audio time base.

use crate::backend::{Frame, MediaKind};
use crate::clip::ClipOutcome;
use crate::sequence::{Sequence, SequenceOutcome};
use crate::Result;

impl Sequence {
    /// Decode the next frame of the sequence.
    ///
    /// The first video frame after a clip change or a seek is flagged as a keyframe, since decoding
    /// always resumes from a real keyframe of the source.
    pub fn read_frame(&mut self) -> Result<SequenceOutcome<Frame>> {
        let Some(mut index) = self.start_cursor() else {
            return Ok(SequenceOutcome::EndOfSequence);
        };

        loop {
            self.heal_cursor(index)?;
            match self.clips[index].read_frame()? {
                ClipOutcome::Ready(mut frame) => {
                    self.restamp(index, &mut frame);
                    return Ok(SequenceOutcome::Ready(frame));
                }
                ClipOutcome::EndOfClip => match self.advance(index)? {
                    Some(next) => index = next,
                    None => return Ok(SequenceOutcome::EndOfSequence),
                },
            }
        }
    }

    fn restamp(&mut self, index: usize, frame: &mut Frame) {
        let clip = &self.clips[index];
        match frame.kind {
            MediaKind::Video => {
                frame.pts = frame.pts.map(|pts| self.video_pkt_to_seq_ts(clip, pts));
                if self.keyframe_pending {
                    frame.key_frame = true;
                    self.keyframe_pending = false;
                }
            }
            MediaKind::Audio => {
                frame.pts = frame.pts.map(|pts| self.audio_pkt_to_seq_ts(clip, pts));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{Backend, SyntheticBackend, SyntheticMedia};
    use crate::clip::Clip;
    use crate::sequence::{Sequence, SequenceConfig, SequenceOutcome};
    use crate::{Frame, Result};
    use std::rc::Rc;

    const FD: i64 = 1001;

    fn sequence(media: SyntheticMedia) -> Result<Sequence> {
        let backend = SyntheticBackend::new();
        for name in ["a.mp4", "b.mp4", "c.mp4"] {
            backend.register(name, media.clone());
        }
        let backend: Rc<dyn Backend> = Rc::new(backend);

        let mut seq = Sequence::new(SequenceConfig::default())?;
        for (name, start, end) in [("a.mp4", 20, 27), ("b.mp4", 60, 68), ("c.mp4", 53, 61)] {
            let mut clip = Clip::open_file(backend.clone(), name)?;
            clip.set_bounds(start, end)?;
            seq.append(clip);
        }
        Ok(seq)
    }

    fn one_pass(seq: &mut Sequence) -> Result<Vec<Frame>> {
        let mut frames = vec![];
        while let SequenceOutcome::Ready(frame) = seq.read_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn test_video_frames_in_sequence_time() -> Result<()> {
        let mut seq = sequence(SyntheticMedia::default().without_audio())?;

        let frames = one_pass(&mut seq)?;
        let pts: Vec<_> = frames.iter().filter_map(|f| f.pts).collect();
        assert_eq!(pts, (0..23).map(|i| i * FD).collect::<Vec<_>>());

        // Clip starts are forced, 4 and 22 are keyframes of their sources
        let keys: Vec<_> = frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.key_frame)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(keys, vec![0, 4, 7, 15, 22]);
        Ok(())
    }

    #[test]
    fn test_second_pass_repeats_first() -> Result<()> {
        let mut seq = sequence(SyntheticMedia::default().without_audio())?;

        let first: Vec<_> = one_pass(&mut seq)?.iter().map(|f| f.pts).collect();
        let second: Vec<_> = one_pass(&mut seq)?.iter().map(|f| f.pts).collect();
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_audio_frames_in_sequence_time() -> Result<()> {
        let mut seq = sequence(SyntheticMedia::default())?;

        let frames = one_pass(&mut seq)?;
        let video = frames.iter().filter(|f| f.is_video()).count();
        let audio: Vec<_> = frames
            .iter()
            .filter(|f| !f.is_video())
            .filter_map(|f| f.pts)
            .collect();

        assert_eq!(video, 23);
        assert!(!audio.is_empty());
        assert!(audio.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(audio.iter().all(|pts| (0..23 * 1600).contains(pts)));
        Ok(())
    }

    #[test]
    fn test_seek_then_decode() -> Result<()> {
        let mut seq = sequence(SyntheticMedia::default().without_audio())?;
        seq.seek(10)?;

        let SequenceOutcome::Ready(frame) = seq.read_frame()? else {
            panic!("expected a frame after seeking");
        };
        assert_eq!(frame.pts, Some(10 * FD));
        assert!(frame.key_frame);

        let SequenceOutcome::Ready(frame) = seq.read_frame()? else {
            panic!("expected a second frame");
        };
        assert_eq!(frame.pts, Some(11 * FD));
        assert!(!frame.key_frame);
        Ok(())
    }

    #[test]
    fn test_empty_sequence() -> Result<()> {
        let mut seq = Sequence::new(SequenceConfig::default())?;
        assert!(matches!(seq.read_frame()?, SequenceOutcome::EndOfSequence));
        Ok(())
    }
}
