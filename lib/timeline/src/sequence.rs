//! Sequences: clips laid end to end on a gapless timeline.
//!
//! Clips are kept ordered by `start_pts` and always abut: `clips[i].end_pts ==
//! clips[i + 1].start_pts` and the first clip starts at zero. Every mutation re-establishes this
//! by shifting the clips that follow the edit point.

use crate::backend::Packet;
use crate::clip::{Clip, ClipId, ClipOutcome, compare_chronological, compare_position};
use crate::{Error, Rational, Result, rational};
use derivative::Derivative;
use derive_setters::Setters;
use std::{cmp::Ordering, fmt};

pub type ClipComparator = fn(&Clip, &Clip) -> Ordering;

/// Where [`Sequence::insert_sorted`] places a new clip.
#[derive(Debug, Clone, Copy, Default)]
pub enum InsertOrder {
    /// By sequence position.
    #[default]
    Position,
    /// By source file modification time, then by position in the source.
    Chronological,
    Custom(ClipComparator),
}

impl InsertOrder {
    pub fn comparator(&self) -> ClipComparator {
        match self {
            InsertOrder::Position => compare_position,
            InsertOrder::Chronological => compare_chronological,
            InsertOrder::Custom(cmp) => *cmp,
        }
    }
}

#[derive(Debug, Clone, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
#[non_exhaustive]
pub struct SequenceConfig {
    #[derivative(Default(value = "Rational::new(1, 30000)"))]
    pub video_time_base: Rational,

    #[derivative(Default(value = "Rational::new(1, 48000)"))]
    pub audio_time_base: Rational,

    #[derivative(Default(value = "29.97"))]
    pub fps: f64,

    #[derivative(Default(value = "InsertOrder::Position"))]
    pub insert_order: InsertOrder,

    /// Close each clip's handle once it has been read to the end.
    #[derivative(Default(value = "false"))]
    pub close_clips: bool,
}

impl SequenceConfig {
    pub fn new(video_time_base: Rational, audio_time_base: Rational, fps: f64) -> Self {
        Self::default()
            .with_video_time_base(video_time_base)
            .with_audio_time_base(audio_time_base)
            .with_fps(fps)
    }

    /// Video time base of `1 / (fps * 1000)` and audio time base of `1 / sample_rate`.
    pub fn from_rates(fps: f64, sample_rate: u32) -> Self {
        let ticks = (fps * 1000.0).round() as i32;
        Self::new(
            Rational::new(1, ticks),
            Rational::new(1, sample_rate as i32),
            fps,
        )
    }
}

/// Outcome of a sequence level read.
#[derive(Debug)]
pub enum SequenceOutcome<T> {
    Ready(T),
    /// A full pass completed and the cursor went back to the first clip.
    EndOfSequence,
}

/// A packet together with the clip it was read from.
///
/// Timestamps are those of the source file; see [`Sequence::video_pkt_to_seq_ts`].
#[derive(Debug)]
pub struct SequencePacket {
    pub clip: ClipId,
    pub packet: Packet,
}

pub struct Sequence {
    pub(crate) clips: Vec<Clip>,
    video_time_base: Rational,
    audio_time_base: Rational,
    fps: f64,
    frame_duration: i64,
    insert_order: InsertOrder,
    close_clips: bool,
    pub(crate) cursor: Option<usize>,
    pub(crate) keyframe_pending: bool,
}

impl Sequence {
    pub fn new(config: SequenceConfig) -> Result<Self> {
        let video_time_base = config.video_time_base.validate()?;
        let audio_time_base = config.audio_time_base.validate()?;
        if !config.fps.is_finite() || config.fps <= 0.0 {
            return Err(Error::InvalidConfig(format!("fps must be positive, got {}", config.fps)));
        }

        let frame_duration = (f64::from(video_time_base.den)
            / (f64::from(video_time_base.num) * config.fps))
            .round() as i64;
        if frame_duration <= 0 {
            return Err(Error::InvalidConfig(format!(
                "time base {video_time_base} is too coarse for {} fps",
                config.fps
            )));
        }

        log::debug!(
            "new sequence: video tb {video_time_base}, audio tb {audio_time_base}, {} fps, frame duration {frame_duration}",
            config.fps
        );

        Ok(Self {
            clips: vec![],
            video_time_base,
            audio_time_base,
            fps: config.fps,
            frame_duration,
            insert_order: config.insert_order,
            close_clips: config.close_clips,
            cursor: None,
            keyframe_pending: true,
        })
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

    /// Length of one frame in the sequence's video time base.
    pub fn frame_duration(&self) -> i64 {
        self.frame_duration
    }

    pub fn insert_order(&self) -> InsertOrder {
        self.insert_order
    }

    pub fn close_clips(&self) -> bool {
        self.close_clips
    }

    pub fn set_close_clips(&mut self, close_clips: bool) {
        self.close_clips = close_clips;
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    pub fn clips(&self) -> &[Clip] {
        &self.clips
    }

    pub fn clip(&self, id: ClipId) -> Option<&Clip> {
        self.clips.iter().find(|clip| clip.id == id)
    }

    pub fn index_of(&self, id: ClipId) -> Option<usize> {
        self.clips.iter().position(|clip| clip.id == id)
    }

    /// Index of the clip being read, `None` when reading restarts from the head.
    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current_clip(&self) -> Option<&Clip> {
        self.cursor.and_then(|index| self.clips.get(index))
    }

    /// End of the last clip, in sequence video time base.
    pub fn duration(&self) -> i64 {
        self.clips.last().map_or(0, |clip| clip.end_pts)
    }

    pub fn duration_frames(&self) -> i64 {
        self.pts_to_frame_index(self.duration())
    }

    pub fn frame_index_to_pts(&self, frame_index: i64) -> i64 {
        frame_index * self.frame_duration
    }

    pub fn pts_to_frame_index(&self, pts: i64) -> i64 {
        pts / self.frame_duration
    }

    /// True when the clips abut and start at zero.
    pub fn is_contiguous(&self) -> bool {
        self.clips.first().is_none_or(|clip| clip.start_pts == 0)
            && self
                .clips
                .windows(2)
                .all(|pair| pair[0].end_pts == pair[1].start_pts)
    }

    fn clip_length(&self, clip: &Clip) -> i64 {
        clip.duration_in(self.video_time_base)
    }

    /// Place `clip` at `index`, right after its predecessor, and push everything behind it back.
    fn insert_at_index(&mut self, index: usize, mut clip: Clip) -> ClipId {
        let start = match index {
            0 => 0,
            _ => self.clips[index - 1].end_pts,
        };
        let length = self.clip_length(&clip);
        clip.set_position(start, start + length);

        for later in &mut self.clips[index..] {
            later.shift(length);
        }

        let id = clip.id;
        log::debug!("insert {clip} at index {index}");
        self.clips.insert(index, clip);
        self.cursor = Some(0);
        id
    }

    /// Add `clip` after the last clip.
    pub fn append(&mut self, clip: Clip) -> ClipId {
        self.insert_at_index(self.clips.len(), clip)
    }

    /// Add `clip` where the configured [`InsertOrder`] puts it, after any equal clips.
    ///
    /// [`InsertOrder::Position`] compares the new clip's current `start_pts`, which is 0 for a
    /// clip that was never placed. Such a clip goes right after the first clip starting at 0, so a
    /// third fresh clip lands at index 1 rather than at the end.
    pub fn insert_sorted(&mut self, clip: Clip) -> ClipId {
        let cmp = self.insert_order.comparator();
        let index = self
            .clips
            .iter()
            .position(|other| cmp(&clip, other) == Ordering::Less)
            .unwrap_or(self.clips.len());
        self.insert_at_index(index, clip)
    }

    /// Add `clip` at the clip boundary at or after `start_pts`.
    pub fn insert_at_pts(&mut self, clip: Clip, start_pts: i64) -> ClipId {
        let index = self
            .clips
            .iter()
            .position(|other| other.start_pts >= start_pts)
            .unwrap_or(self.clips.len());
        self.insert_at_index(index, clip)
    }

    pub fn insert_at_frame(&mut self, clip: Clip, frame_index: i64) -> ClipId {
        self.insert_at_pts(clip, self.frame_index_to_pts(frame_index))
    }

    /// Remove a clip and pull every following clip back by its length.
    pub fn ripple_delete(&mut self, id: ClipId) -> Result<Clip> {
        let index = self.index_of(id).ok_or(Error::ClipNotFound(id))?;
        let clip = self.clips.remove(index);
        let length = clip.end_pts - clip.start_pts;

        for later in &mut self.clips[index..] {
            later.shift(-length);
        }

        self.cursor = match self.cursor {
            _ if self.clips.is_empty() => None,
            Some(cursor) if cursor > index => Some(cursor - 1),
            Some(cursor) if cursor == index => Some(0),
            cursor => cursor,
        };

        log::debug!("ripple delete {clip}");
        Ok(clip)
    }

    /// Index of the clip covering `frame_index` and the matching position inside that clip, in
    /// the clip's own video time base.
    fn locate(&self, frame_index: i64) -> Option<(usize, i64)> {
        let seq_pts = self.frame_index_to_pts(frame_index);
        let index = self
            .clips
            .iter()
            .position(|clip| clip.start_pts <= seq_pts && seq_pts < clip.end_pts)?;

        let clip = &self.clips[index];
        let relative = rational::convert(
            seq_pts - clip.start_pts,
            self.video_time_base,
            clip.video_time_base(),
        );
        Some((index, relative))
    }

    /// The clip covering `frame_index` and the position inside it, in the clip's time base.
    pub fn locate_clip_at_frame(&self, frame_index: i64) -> Option<(&Clip, i64)> {
        self.locate(frame_index)
            .map(|(index, relative)| (&self.clips[index], relative))
    }

    /// Split the clip covering `frame_index` so a new clip starts exactly at that frame.
    pub fn cut_clip_at_frame(&mut self, frame_index: i64) -> Result<ClipId> {
        let (index, relative) = self
            .locate(frame_index)
            .ok_or(Error::NoClipAtFrame(frame_index))?;
        let split = self.frame_index_to_pts(frame_index);

        let head = &mut self.clips[index];
        let mut tail = head.cut(relative)?;
        let end = head.end_pts;
        head.end_pts = split;
        tail.set_position(split, end);

        let id = tail.id;
        self.clips.insert(index + 1, tail);
        if let Some(cursor) = self.cursor.filter(|cursor| *cursor > index) {
            self.cursor = Some(cursor + 1);
        }

        log::debug!("cut sequence at frame {frame_index} (pts {split})");
        Ok(id)
    }

    /// Position the read cursor on `frame_index`.
    pub fn seek(&mut self, frame_index: i64) -> Result<()> {
        let (index, relative) = self
            .locate(frame_index)
            .ok_or(Error::NoClipAtFrame(frame_index))?;

        if let Some(previous) = self.cursor.filter(|previous| *previous != index) {
            let target = &self.clips[index];
            if let Some(clip) = self.clips.get(previous)
                && !clip.shares_handle_with(target)
            {
                self.clips[previous].close();
            }
        }

        self.cursor = Some(index);
        self.keyframe_pending = true;

        let clip = &mut self.clips[index];
        clip.open()?;
        clip.seek_pts(relative)
    }

    /// Cursor to read from, starting over at the head when unset.
    pub(crate) fn start_cursor(&mut self) -> Option<usize> {
        if self.clips.is_empty() {
            self.cursor = None;
            return None;
        }

        match self.cursor {
            Some(index) if index < self.clips.len() => Some(index),
            _ => {
                self.cursor = Some(0);
                Some(0)
            }
        }
    }

    /// Move past the exhausted clip at `index`. `None` once the sequence wrapped to its start.
    pub(crate) fn advance(&mut self, index: usize) -> Result<Option<usize>> {
        if self.close_clips {
            self.clips[index].close();
        }
        self.keyframe_pending = true;

        let next = index + 1;
        if next < self.clips.len() {
            self.cursor = Some(next);
            self.clips[next].open()?;
            return Ok(Some(next));
        }

        log::debug!("end of sequence, rewinding to the first clip");
        // Closing the last clip is up to `close_clips` alone
        self.cursor = None;
        self.seek(0)?;
        Ok(None)
    }

    /// Reseek the clip at `index` when another clip sharing its handle moved it.
    pub(crate) fn heal_cursor(&mut self, index: usize) -> Result<()> {
        let clip = &mut self.clips[index];
        if clip.is_open() && clip.is_handle_out_of_bounds() {
            log::trace!("{clip} handle moved away, reseeking");
            clip.reset()?;
            self.keyframe_pending = true;
        }
        Ok(())
    }

    /// Next packet of the sequence, moving from clip to clip.
    pub fn read_packet(&mut self) -> Result<SequenceOutcome<SequencePacket>> {
        let Some(mut index) = self.start_cursor() else {
            return Ok(SequenceOutcome::EndOfSequence);
        };

        loop {
            self.heal_cursor(index)?;
            let clip = &mut self.clips[index];
            match clip.read_packet()? {
                ClipOutcome::Ready(packet) => {
                    return Ok(SequenceOutcome::Ready(SequencePacket {
                        clip: clip.id,
                        packet,
                    }));
                }
                ClipOutcome::EndOfClip => match self.advance(index)? {
                    Some(next) => index = next,
                    None => return Ok(SequenceOutcome::EndOfSequence),
                },
            }
        }
    }

    /// Source video timestamp of `clip` in sequence video time base.
    pub fn video_pkt_to_seq_ts(&self, clip: &Clip, ts: i64) -> i64 {
        rational::convert(
            clip.video_relative_ts(ts),
            clip.video_time_base(),
            self.video_time_base,
        ) + clip.start_pts
    }

    /// Source audio timestamp of `clip` in sequence audio time base.
    pub fn audio_pkt_to_seq_ts(&self, clip: &Clip, ts: i64) -> i64 {
        let offset = rational::convert(clip.start_pts, self.video_time_base, self.audio_time_base);
        rational::convert(
            clip.audio_relative_ts(ts),
            clip.audio_time_base(),
            self.audio_time_base,
        ) + offset
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "sequence: {} clips, {} frames, video tb {}, audio tb {}",
            self.clips.len(),
            self.duration_frames(),
            self.video_time_base,
            self.audio_time_base
        )?;

        for (index, clip) in self.clips.iter().enumerate() {
            let marker = if self.cursor == Some(index) { '>' } else { ' ' };
            writeln!(f, "{marker} {index:>3} {clip}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("clips", &self.clips)
            .field("video_time_base", &self.video_time_base)
            .field("audio_time_base", &self.audio_time_base)
            .field("fps", &self.fps)
            .field("frame_duration", &self.frame_duration)
            .field("cursor", &self.cursor)
            .finish()
    }
}
