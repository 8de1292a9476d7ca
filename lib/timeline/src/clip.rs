//! Clips: a trimmed region of a source file and its place on a sequence.
//!
//! `orig_*` bounds live in the source's video time base and describe the trimmed region.
//! `start_pts`/`end_pts` live in the owning sequence's video time base and are maintained by the
//! sequence. Both ranges are inclusive at the start and exclusive at the end.

use crate::backend::{Backend, MediaKind, Packet};
use crate::media::{MediaHandle, SharedHandle};
use crate::{Error, Rational, Result, rational};
use std::{
    cmp::Ordering,
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
    time::SystemTime,
};

static NEXT_CLIP_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a clip, preserved while it moves around a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClipId(u64);

impl ClipId {
    fn next() -> Self {
        Self(NEXT_CLIP_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of a clip level read.
#[derive(Debug)]
pub enum ClipOutcome<T> {
    Ready(T),
    /// The bound was exhausted and the clip rewound to its own start.
    EndOfClip,
}

pub struct Clip {
    pub(crate) id: ClipId,
    pub(crate) handle: SharedHandle,
    pub(crate) orig_start_pts: i64,
    pub(crate) orig_end_pts: i64,
    pub(crate) start_pts: i64,
    pub(crate) end_pts: i64,
    pub(crate) done_reading_video: bool,
    pub(crate) done_reading_audio: bool,
    pub(crate) frame_index: i64,
}

impl Clip {
    /// Open `path` and create a clip spanning the whole file.
    pub fn open_file(backend: Rc<dyn Backend>, path: impl Into<PathBuf>) -> Result<Self> {
        let handle = MediaHandle::open_shared(backend, path)?;
        Ok(Self::from_handle(handle))
    }

    /// Create a clip spanning everything `handle` knows about.
    pub fn from_handle(handle: SharedHandle) -> Self {
        let (duration, has_audio) = {
            let handle = handle.borrow();
            (handle.duration(), handle.has_audio())
        };

        Self {
            id: ClipId::next(),
            handle,
            orig_start_pts: 0,
            orig_end_pts: duration,
            start_pts: 0,
            end_pts: 0,
            done_reading_video: false,
            done_reading_audio: !has_audio,
            frame_index: 0,
        }
    }

    /// A new clip with the same bounds, sharing this clip's handle.
    pub fn share(&self) -> Self {
        Self {
            id: ClipId::next(),
            handle: self.handle.clone(),
            orig_start_pts: self.orig_start_pts,
            orig_end_pts: self.orig_end_pts,
            start_pts: self.start_pts,
            end_pts: self.end_pts,
            done_reading_video: false,
            done_reading_audio: !self.has_audio(),
            frame_index: 0,
        }
    }

    pub fn id(&self) -> ClipId {
        self.id
    }

    pub fn handle(&self) -> &SharedHandle {
        &self.handle
    }

    /// Number of clips currently sharing this clip's handle.
    pub fn handle_refs(&self) -> usize {
        Rc::strong_count(&self.handle)
    }

    pub fn shares_handle_with(&self, other: &Clip) -> bool {
        Rc::ptr_eq(&self.handle, &other.handle)
    }

    pub fn path(&self) -> PathBuf {
        self.handle.borrow().path().to_path_buf()
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.handle.borrow().modified()
    }

    pub fn has_audio(&self) -> bool {
        self.handle.borrow().has_audio()
    }

    pub fn video_time_base(&self) -> Rational {
        self.handle.borrow().video_time_base()
    }

    pub fn audio_time_base(&self) -> Rational {
        self.handle.borrow().audio_time_base()
    }

    pub fn frame_duration(&self) -> i64 {
        self.handle.borrow().frame_duration()
    }

    pub fn orig_start_pts(&self) -> i64 {
        self.orig_start_pts
    }

    pub fn orig_end_pts(&self) -> i64 {
        self.orig_end_pts
    }

    pub fn start_pts(&self) -> i64 {
        self.start_pts
    }

    pub fn end_pts(&self) -> i64 {
        self.end_pts
    }

    pub fn done_reading_video(&self) -> bool {
        self.done_reading_video
    }

    pub fn done_reading_audio(&self) -> bool {
        self.done_reading_audio
    }

    /// Video frames decoded since the last reset.
    pub fn frame_index(&self) -> i64 {
        self.frame_index
    }

    /// Length of the trimmed region in the source's video time base.
    pub fn duration_pts(&self) -> i64 {
        self.orig_end_pts - self.orig_start_pts
    }

    pub fn frame_count(&self) -> i64 {
        self.handle.borrow().frame_index_for_pts(self.duration_pts())
    }

    /// Length of the trimmed region once rescaled into `time_base`.
    pub fn duration_in(&self, time_base: Rational) -> i64 {
        rational::convert(self.duration_pts(), self.video_time_base(), time_base)
    }

    pub fn start_frame_index(&self) -> i64 {
        self.handle.borrow().frame_index_for_pts(self.orig_start_pts)
    }

    /// First frame index past the clip.
    pub fn end_frame_index(&self) -> i64 {
        self.handle.borrow().frame_index_for_pts(self.orig_end_pts)
    }

    pub fn absolute_pts(&self, relative_pts: i64) -> i64 {
        self.orig_start_pts + relative_pts
    }

    pub fn relative_pts(&self, absolute_pts: i64) -> i64 {
        absolute_pts - self.orig_start_pts
    }

    /// Video timestamp of the source file made relative to the clip start.
    pub fn video_relative_ts(&self, ts: i64) -> i64 {
        ts - self.orig_start_pts
    }

    /// Audio timestamp of the source file made relative to the clip start.
    pub fn audio_relative_ts(&self, ts: i64) -> i64 {
        ts - self.audio_start_pts()
    }

    pub(crate) fn audio_start_pts(&self) -> i64 {
        self.handle
            .borrow()
            .audio_pts_for_video_pts(self.orig_start_pts)
            .unwrap_or_default()
    }

    /// Seek position of the shared handle in source video time base.
    pub(crate) fn handle_seek_pts(&self, kind: MediaKind) -> i64 {
        let handle = self.handle.borrow();
        match kind {
            MediaKind::Video => handle.seek_pts(),
            MediaKind::Audio => handle
                .audio_pts_for_video_pts(handle.seek_pts())
                .unwrap_or_default(),
        }
    }

    /// Trim the clip to frames `[start_frame, end_frame)` of its source.
    pub fn set_bounds(&mut self, start_frame: i64, end_frame: i64) -> Result<()> {
        let (start, end) = {
            let handle = self.handle.borrow();
            (
                handle.pts_for_frame_index(start_frame),
                handle.pts_for_frame_index(end_frame),
            )
        };
        self.set_bounds_pts(start, end)
    }

    /// Trim the clip to `[orig_start_pts, orig_end_pts)` and seek the handle to the new start.
    pub fn set_bounds_pts(&mut self, orig_start_pts: i64, orig_end_pts: i64) -> Result<()> {
        if orig_start_pts < 0 || orig_end_pts < 0 {
            return Err(Error::InvalidBounds(format!(
                "negative bound [{orig_start_pts}, {orig_end_pts})"
            )));
        }

        let frame_duration = self.frame_duration().max(1);
        if orig_end_pts - orig_start_pts < frame_duration {
            return Err(Error::InvalidBounds(format!(
                "[{orig_start_pts}, {orig_end_pts}) is shorter than one frame ({frame_duration})"
            )));
        }

        {
            let mut handle = self.handle.borrow_mut();
            handle.open()?;
            handle.seek(orig_start_pts)?;
        }

        self.orig_start_pts = orig_start_pts;
        self.orig_end_pts = orig_end_pts;
        self.clear_read_state();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.handle.borrow().is_open()
    }

    /// Open the shared handle. A handle that had been closed is rewound to this clip's start.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.handle.borrow_mut().open()?;
        self.reset()
    }

    /// Close the shared handle, affecting every clip that shares it.
    pub fn close(&mut self) {
        self.handle.borrow_mut().close();
    }

    /// Rewind to the start of the bound and clear the exhaustion flags.
    pub fn reset(&mut self) -> Result<()> {
        self.handle.borrow_mut().seek(self.orig_start_pts)?;
        self.clear_read_state();
        Ok(())
    }

    fn clear_read_state(&mut self) {
        self.done_reading_video = false;
        self.done_reading_audio = !self.has_audio();
        self.frame_index = 0;
    }

    /// Seek to `relative_pts` past the clip start.
    pub fn seek_pts(&mut self, relative_pts: i64) -> Result<()> {
        if relative_pts < 0 || relative_pts >= self.duration_pts() {
            return Err(Error::InvalidBounds(format!(
                "relative position {relative_pts} outside clip of {}",
                self.duration_pts()
            )));
        }

        self.open()?;
        self.handle
            .borrow_mut()
            .seek(self.absolute_pts(relative_pts))?;
        self.clear_read_state();
        self.frame_index = self.handle.borrow().frame_index_for_pts(relative_pts);
        Ok(())
    }

    /// Seek to the `frame_index`th frame of the clip.
    pub fn seek(&mut self, frame_index: i64) -> Result<()> {
        let relative_pts = self.handle.borrow().pts_for_frame_index(frame_index);
        self.seek_pts(relative_pts)
    }

    /// True when another user of the shared handle moved it outside this clip's bound.
    pub fn is_handle_out_of_bounds(&self) -> bool {
        let seek_pts = self.handle.borrow().seek_pts();
        seek_pts < self.orig_start_pts || seek_pts >= self.orig_end_pts
    }

    /// Next packet inside the bound.
    ///
    /// Packets of a stream that already passed the end bound are skipped until the other stream
    /// catches up. End of file, or both streams passing the end, rewinds the clip and reports
    /// [`ClipOutcome::EndOfClip`], so the packet stream restarts on the next call.
    pub fn read_packet(&mut self) -> Result<ClipOutcome<Packet>> {
        self.open()?;
        let audio_end_pts = self
            .handle
            .borrow()
            .audio_pts_for_video_pts(self.orig_end_pts);

        loop {
            let next = self.handle.borrow_mut().read_raw_packet();
            let packet = match next {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    log::trace!("clip {} hit end of file", self.id);
                    self.reset()?;
                    return Ok(ClipOutcome::EndOfClip);
                }
                Err(e) => {
                    if let Err(reset_err) = self.reset() {
                        log::warn!("clip {} failed to rewind after error: {reset_err}", self.id);
                    }
                    return Err(e);
                }
            };

            match packet.kind {
                Some(MediaKind::Video) if !self.done_reading_video => match packet.timestamp() {
                    Some(ts) if ts >= self.orig_end_pts => {
                        log::trace!("clip {} video done at {ts}", self.id);
                        self.done_reading_video = true;
                    }
                    ts => {
                        if let Some(ts) = ts {
                            self.handle.borrow_mut().set_curr_pts(ts);
                        }
                        return Ok(ClipOutcome::Ready(packet));
                    }
                },
                Some(MediaKind::Audio) if !self.done_reading_audio => {
                    match (packet.timestamp(), audio_end_pts) {
                        (Some(ts), Some(end)) if ts >= end => {
                            log::trace!("clip {} audio done at {ts}", self.id);
                            self.done_reading_audio = true;
                        }
                        _ => return Ok(ClipOutcome::Ready(packet)),
                    }
                }
                _ => continue,
            }

            if self.done_reading_video && self.done_reading_audio {
                self.reset()?;
                return Ok(ClipOutcome::EndOfClip);
            }
        }
    }

    /// Split the clip `relative_pts` past its start.
    ///
    /// This clip keeps the head, the returned clip shares the handle and covers the tail. Only
    /// source bounds change; sequence positions are the caller's business.
    pub fn cut(&mut self, relative_pts: i64) -> Result<Clip> {
        let frame_duration = self.frame_duration();
        let duration = self.duration_pts();
        if relative_pts < frame_duration || relative_pts >= duration {
            return Err(Error::InvalidBounds(format!(
                "cannot cut clip {} of {duration} at {relative_pts}",
                self.id
            )));
        }

        let split = self.orig_start_pts + relative_pts;
        let mut tail = self.share();
        tail.orig_start_pts = split;
        tail.orig_end_pts = self.orig_end_pts;
        self.orig_end_pts = split;

        log::debug!(
            "cut clip {} at {split}: [{}, {split}) + {} [{split}, {})",
            self.id,
            self.orig_start_pts,
            tail.id,
            tail.orig_end_pts
        );
        Ok(tail)
    }

    pub(crate) fn set_position(&mut self, start_pts: i64, end_pts: i64) {
        self.start_pts = start_pts;
        self.end_pts = end_pts;
    }

    pub(crate) fn shift(&mut self, delta: i64) {
        self.start_pts += delta;
        self.end_pts += delta;
    }
}

/// Order by position on the sequence.
pub fn compare_position(a: &Clip, b: &Clip) -> Ordering {
    a.start_pts.cmp(&b.start_pts)
}

/// Order by source modification time, then by position inside the source.
pub fn compare_chronological(a: &Clip, b: &Clip) -> Ordering {
    a.modified()
        .cmp(&b.modified())
        .then_with(|| a.orig_start_pts.cmp(&b.orig_start_pts))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl fmt::Display for Clip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clip {} {} orig [{}, {}) seq [{}, {})",
            self.id,
            file_name(&self.path()),
            self.orig_start_pts,
            self.orig_end_pts,
            self.start_pts,
            self.end_pts
        )
    }
}

impl fmt::Debug for Clip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clip")
            .field("id", &self.id)
            .field("path", &self.path())
            .field("orig_start_pts", &self.orig_start_pts)
            .field("orig_end_pts", &self.orig_end_pts)
            .field("start_pts", &self.start_pts)
            .field("end_pts", &self.end_pts)
            .field("done_reading_video", &self.done_reading_video)
            .field("done_reading_audio", &self.done_reading_audio)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SyntheticBackend, SyntheticMedia};

    const FD: i64 = 1001;

    fn clip_with(media: SyntheticMedia) -> Result<Clip> {
        let backend = SyntheticBackend::new();
        backend.register("a.mp4", media);
        Clip::open_file(Rc::new(backend), "a.mp4")
    }

    fn video_only() -> Result<Clip> {
        clip_with(SyntheticMedia::default().without_audio())
    }

    fn drain(clip: &mut Clip) -> Result<Vec<Packet>> {
        let mut packets = vec![];
        while let ClipOutcome::Ready(packet) = clip.read_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    #[test]
    fn test_open_spans_whole_file() -> Result<()> {
        let clip = video_only()?;
        assert_eq!(clip.orig_start_pts(), 0);
        assert_eq!(clip.orig_end_pts(), 300 * FD);
        assert_eq!(clip.frame_count(), 300);
        assert_eq!(clip.handle_refs(), 1);
        assert!(clip.done_reading_audio());
        Ok(())
    }

    #[test]
    fn test_set_bounds_validation() -> Result<()> {
        let mut clip = video_only()?;
        assert!(clip.set_bounds(-1, 5).is_err());
        assert!(clip.set_bounds(5, 5).is_err());
        assert!(clip.set_bounds_pts(100, 100 + FD - 1).is_err());
        assert_eq!(clip.orig_end_pts(), 300 * FD);

        clip.set_bounds(20, 27)?;
        assert_eq!(clip.orig_start_pts(), 20 * FD);
        assert_eq!(clip.orig_end_pts(), 27 * FD);
        assert_eq!(clip.handle().borrow().seek_pts(), 20 * FD);
        assert_eq!(clip.frame_count(), 7);
        assert_eq!(clip.end_frame_index(), 27);
        Ok(())
    }

    #[test]
    fn test_packet_cycle_restarts() -> Result<()> {
        let mut clip = video_only()?;
        clip.set_bounds(24, 31)?;

        let first = drain(&mut clip)?;
        let pts: Vec<_> = first.iter().filter_map(|p| p.pts).collect();
        assert_eq!(pts, (24..31).map(|i| i * FD).collect::<Vec<_>>());
        assert!(!clip.done_reading_video());

        let second = drain(&mut clip)?;
        assert_eq!(second.len(), 7);
        assert_eq!(second[0].pts, Some(24 * FD));
        Ok(())
    }

    #[test]
    fn test_packets_start_at_previous_keyframe() -> Result<()> {
        let mut clip = video_only()?;
        clip.set_bounds(20, 27)?;

        let packets = drain(&mut clip)?;
        assert_eq!(packets.first().and_then(|p| p.pts), Some(12 * FD));
        assert_eq!(packets.last().and_then(|p| p.pts), Some(26 * FD));
        Ok(())
    }

    #[test]
    fn test_audio_drained_to_its_own_bound() -> Result<()> {
        let mut clip = clip_with(SyntheticMedia::default())?;
        clip.set_bounds(24, 31)?;
        let audio_end = clip.handle().borrow().audio_pts_for_video_pts(31 * FD);
        assert_eq!(audio_end, Some(49_650));

        let packets = drain(&mut clip)?;
        let video = packets
            .iter()
            .filter(|p| p.kind == Some(MediaKind::Video))
            .count();
        let audio: Vec<_> = packets
            .iter()
            .filter(|p| p.kind == Some(MediaKind::Audio))
            .filter_map(|p| p.pts)
            .collect();

        assert_eq!(video, 7);
        assert_eq!(audio.len(), 11);
        assert!(audio.iter().all(|pts| *pts < 49_650));
        Ok(())
    }

    #[test]
    fn test_end_of_file_ends_clip() -> Result<()> {
        let mut clip = clip_with(SyntheticMedia::default())?;
        clip.set_bounds(288, 300)?;

        let packets = drain(&mut clip)?;
        let video = packets
            .iter()
            .filter(|p| p.kind == Some(MediaKind::Video))
            .count();
        assert_eq!(video, 12);
        assert!(packets.iter().any(|p| p.kind == Some(MediaKind::Audio)));
        assert_eq!(clip.handle().borrow().seek_pts(), 288 * FD);
        Ok(())
    }

    #[test]
    fn test_handle_out_of_bounds_after_shared_seek() -> Result<()> {
        let mut a = video_only()?;
        a.set_bounds(20, 27)?;
        assert!(!a.is_handle_out_of_bounds());

        let mut b = a.share();
        assert_eq!(a.handle_refs(), 2);
        assert!(a.shares_handle_with(&b));

        b.set_bounds(60, 68)?;
        assert!(a.is_handle_out_of_bounds());
        assert!(!b.is_handle_out_of_bounds());

        a.reset()?;
        assert!(!a.is_handle_out_of_bounds());
        assert!(b.is_handle_out_of_bounds());
        Ok(())
    }

    #[test]
    fn test_cut_splits_source_range() -> Result<()> {
        let mut clip = video_only()?;
        clip.set_bounds(20, 27)?;
        let (start, end) = (clip.orig_start_pts(), clip.orig_end_pts());

        let tail = clip.cut(2 * FD)?;
        assert_eq!(clip.orig_start_pts(), start);
        assert_eq!(clip.orig_end_pts(), tail.orig_start_pts());
        assert_eq!(tail.orig_end_pts(), end);
        assert_eq!(clip.frame_count() + tail.frame_count(), 7);
        assert_eq!(clip.handle_refs(), 2);
        assert_ne!(clip.id(), tail.id());

        drop(tail);
        assert_eq!(clip.handle_refs(), 1);
        Ok(())
    }

    #[test]
    fn test_cut_rejects_degenerate_pieces() -> Result<()> {
        let mut clip = video_only()?;
        clip.set_bounds(20, 27)?;

        assert!(clip.cut(0).is_err());
        assert!(clip.cut(FD - 1).is_err());
        assert!(clip.cut(7 * FD).is_err());
        assert!(clip.cut(8 * FD).is_err());
        assert_eq!(clip.orig_end_pts(), 27 * FD);
        assert_eq!(clip.handle_refs(), 1);
        Ok(())
    }

    #[test]
    fn test_close_and_reopen_rewinds() -> Result<()> {
        let mut clip = video_only()?;
        clip.set_bounds(24, 31)?;
        clip.read_packet()?;
        clip.read_packet()?;

        clip.close();
        assert!(!clip.is_open());

        let ClipOutcome::Ready(packet) = clip.read_packet()? else {
            panic!("expected a packet after reopening");
        };
        assert_eq!(packet.pts, Some(24 * FD));
        Ok(())
    }

    #[test]
    fn test_seek_inside_clip() -> Result<()> {
        let mut clip = video_only()?;
        clip.set_bounds(24, 40)?;

        clip.seek(3)?;
        assert_eq!(clip.handle().borrow().seek_pts(), 27 * FD);
        assert_eq!(clip.frame_index(), 3);
        assert!(clip.seek(16).is_err());
        assert!(clip.seek_pts(-1).is_err());
        Ok(())
    }

    #[test]
    fn test_chronological_order() -> Result<()> {
        let backend = SyntheticBackend::new();
        let early = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(10);
        let late = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(20);
        backend.register("early.mp4", SyntheticMedia::default().with_modified(Some(early)));
        backend.register("late.mp4", SyntheticMedia::default().with_modified(Some(late)));
        let backend: Rc<dyn Backend> = Rc::new(backend);

        let mut late_clip = Clip::open_file(backend.clone(), "late.mp4")?;
        late_clip.set_bounds(0, 10)?;
        let mut early_head = Clip::open_file(backend.clone(), "early.mp4")?;
        early_head.set_bounds(5, 10)?;
        let mut early_tail = early_head.share();
        early_tail.set_bounds(50, 60)?;

        assert_eq!(compare_chronological(&early_head, &late_clip), Ordering::Less);
        assert_eq!(compare_chronological(&early_tail, &early_head), Ordering::Greater);
        assert_eq!(compare_chronological(&late_clip, &early_tail), Ordering::Greater);
        Ok(())
    }
}
