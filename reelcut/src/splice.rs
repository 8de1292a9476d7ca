//! Random splice editor.
//!
//! Cuts random spans out of a source sequence and gathers them, in capture order, into a new
//! sequence until it is long enough.

use anyhow::{Context, Result, bail};
use derive_setters::Setters;
use rand::Rng;
use std::{
    path::{Path, PathBuf},
    rc::Rc,
};
use timeline::{Backend, Clip, InsertOrder, Sequence, SequenceConfig};
use walkdir::WalkDir;

/// Attempts at finding a span inside a single clip before giving up.
pub const PICK_FRAMES_RETRY_LIMIT: usize = 50;

#[derive(Debug, Clone, Setters)]
#[setters(prefix = "with_")]
pub struct SpliceParams {
    pub output: PathBuf,
    pub fps: f64,
    pub sample_rate: u32,
    pub source_dir: PathBuf,

    /// Output length in frames
    pub duration: i64,

    /// Average cut length in frames
    pub cut_len_avg: i64,

    /// Maximum deviation from `cut_len_avg`
    pub cut_len_var: i64,
}

impl SpliceParams {
    pub fn validate(&self) -> Result<()> {
        if self.duration <= 0 {
            bail!("duration must be positive, got {}", self.duration);
        }
        if self.cut_len_avg <= 0 {
            bail!("cut_len_avg must be positive, got {}", self.cut_len_avg);
        }
        if self.cut_len_var < 0 || self.cut_len_var > self.cut_len_avg {
            bail!(
                "cut_len_var[{}] must be between 0 and cut_len_avg[{}]",
                self.cut_len_var,
                self.cut_len_avg
            );
        }
        Ok(())
    }

    pub fn sequence_config(&self) -> SequenceConfig {
        SequenceConfig::from_rates(self.fps, self.sample_rate)
            .with_insert_order(InsertOrder::Chronological)
    }
}

/// Regular files directly inside `dir`, sorted by name.
pub fn scan_sources(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = vec![];
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("scan {} failed", dir.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    if files.is_empty() {
        bail!("no source files in {}", dir.display());
    }
    Ok(files)
}

/// Sequence of every file in `files`, ordered by capture time.
pub fn load_sources(
    backend: &Rc<dyn Backend>,
    files: &[PathBuf],
    config: SequenceConfig,
) -> Result<Sequence> {
    let mut seq = Sequence::new(config)?;
    for file in files {
        let clip = Clip::open_file(backend.clone(), file)
            .with_context(|| format!("open source {} failed", file.display()))?;
        log::info!("added {clip}");
        seq.insert_sorted(clip);
    }
    Ok(seq)
}

/// Pick frames `[start, end)` that lie inside a single clip of `seq`.
pub fn pick_frames(seq: &Sequence, params: &SpliceParams, rng: &mut impl Rng) -> Result<(i64, i64)> {
    let total = seq.duration_frames();
    if total <= params.cut_len_avg {
        bail!(
            "{total} frames of source left, not enough for cuts of {}",
            params.cut_len_avg
        );
    }

    let mut attempts = 0;
    while attempts < PICK_FRAMES_RETRY_LIMIT {
        attempts += 1;

        let start = rng.random_range(0..total - params.cut_len_avg);
        let deviation = match params.cut_len_var {
            0 => 0,
            var => rng.random_range(-var..=var),
        };
        let end = (start + params.cut_len_avg + deviation).min(total);
        if end <= start {
            continue;
        }

        let same_clip = match (seq.locate_clip_at_frame(start), seq.locate_clip_at_frame(end - 1)) {
            (Some((a, _)), Some((b, _))) => a.id() == b.id(),
            _ => false,
        };
        if same_clip {
            log::debug!("picked frames [{start}, {end}) after {attempts} attempts");
            return Ok((start, end));
        }
    }

    bail!("no span inside a single clip after {PICK_FRAMES_RETRY_LIMIT} attempts")
}

/// Cut the sequence at `frame` unless that is within one source frame of a clip edge.
///
/// When source and sequence frame rates differ, clip edges fall between sequence frames. A cut that
/// close to an edge snaps to it instead.
fn cut_unless_boundary(seq: &mut Sequence, frame: i64) -> Result<()> {
    let at_boundary = match seq.locate_clip_at_frame(frame) {
        Some((clip, relative)) => {
            let frame_duration = clip.frame_duration();
            relative < frame_duration || clip.duration_pts() - relative < frame_duration
        }
        None => true,
    };
    if at_boundary {
        log::trace!("frame {frame} is on a clip boundary, not cutting");
        return Ok(());
    }

    seq.cut_clip_at_frame(frame)
        .with_context(|| format!("cut at frame {frame} failed"))?;
    Ok(())
}

/// Move frames `[start, end)` of `source` into `target`.
///
/// The span becomes a clip of its own in `source`, a copy sharing its media handle is inserted into
/// `target` in capture order, and the span is ripple deleted from `source`.
pub fn cut_remove_insert(source: &mut Sequence, target: &mut Sequence, start: i64, end: i64) -> Result<()> {
    let center = start + (end - start) / 2;
    cut_unless_boundary(source, start)?;
    cut_unless_boundary(source, end)?;

    let (id, copy) = {
        let (clip, _) = source
            .locate_clip_at_frame(center)
            .with_context(|| format!("no clip at cut center {center}"))?;
        let mut copy = clip.share();
        copy.set_bounds_pts(clip.orig_start_pts(), clip.orig_end_pts())?;
        (clip.id(), copy)
    };

    log::debug!("moving {copy}");
    target.insert_sorted(copy);
    source.ripple_delete(id)?;
    Ok(())
}

/// One random cut from `source` into `target`.
pub fn random_cut(
    source: &mut Sequence,
    target: &mut Sequence,
    params: &SpliceParams,
    rng: &mut impl Rng,
) -> Result<()> {
    let (start, end) = pick_frames(source, params, rng).context("pick frames failed")?;
    cut_remove_insert(source, target, start, end)
}

/// Keep cutting until `target` is longer than the requested duration.
pub fn random_edit(
    source: &mut Sequence,
    target: &mut Sequence,
    params: &SpliceParams,
    rng: &mut impl Rng,
) -> Result<()> {
    params.validate()?;

    while target.duration_frames() <= params.duration {
        random_cut(source, target, params, rng).with_context(|| {
            format!(
                "edit stopped at {} of {} frames",
                target.duration_frames(),
                params.duration
            )
        })?;
    }

    log::info!(
        "random edit done: {} clips, {} frames",
        target.len(),
        target.duration_frames()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};
    use timeline::{
        Rational,
        backend::{SyntheticBackend, SyntheticMedia},
    };

    fn params() -> SpliceParams {
        SpliceParams {
            output: PathBuf::from("out.mp4"),
            fps: 29.97,
            sample_rate: 48000,
            source_dir: PathBuf::from("."),
            duration: 120,
            cut_len_avg: 30,
            cut_len_var: 10,
        }
    }

    fn source(names: &[&str]) -> Result<Sequence> {
        let backend = SyntheticBackend::new();
        for name in names {
            backend.register(*name, SyntheticMedia::default().without_audio());
        }
        let backend: Rc<dyn Backend> = Rc::new(backend);
        let files: Vec<_> = names.iter().map(PathBuf::from).collect();
        load_sources(&backend, &files, params().sequence_config())
    }

    fn pal_source(names: &[&str]) -> Result<Sequence> {
        let backend = SyntheticBackend::new();
        for name in names {
            backend.register(
                *name,
                SyntheticMedia::default()
                    .without_audio()
                    .with_video_time_base(Rational::new(1, 25000))
                    .with_frame_duration(1000)
                    .with_frame_count(100)
                    .with_avg_frame_rate(Rational::new(25, 1)),
            );
        }
        let backend: Rc<dyn Backend> = Rc::new(backend);
        let files: Vec<_> = names.iter().map(PathBuf::from).collect();
        load_sources(&backend, &files, params().sequence_config())
    }

    #[test]
    fn test_params_validation() {
        assert!(params().validate().is_ok());
        assert!(params().with_cut_len_var(31).validate().is_err());
        assert!(params().with_cut_len_avg(0).validate().is_err());
        assert!(params().with_duration(0).validate().is_err());
        assert!(params().with_cut_len_var(30).validate().is_ok());
    }

    #[test]
    fn test_pick_frames_stays_in_one_clip() -> Result<()> {
        let seq = source(&["a.mp4", "b.mp4"])?;
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..100 {
            let (start, end) = pick_frames(&seq, &params(), &mut rng)?;
            assert!(start < end);
            assert!((20..=40).contains(&(end - start)));

            let (a, _) = seq.locate_clip_at_frame(start).unwrap();
            let (b, _) = seq.locate_clip_at_frame(end - 1).unwrap();
            assert_eq!(a.id(), b.id());
        }
        Ok(())
    }

    #[test]
    fn test_pick_frames_needs_material() -> Result<()> {
        let seq = source(&["a.mp4"])?;
        let mut rng = StdRng::seed_from_u64(7);
        assert!(pick_frames(&seq, &params().with_cut_len_avg(300), &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn test_cut_remove_insert_moves_span() -> Result<()> {
        let mut src = source(&["a.mp4"])?;
        let mut dst = Sequence::new(params().sequence_config())?;

        cut_remove_insert(&mut src, &mut dst, 100, 130)?;
        assert_eq!(src.duration_frames(), 270);
        assert_eq!(src.len(), 2);
        assert!(src.is_contiguous());

        assert_eq!(dst.len(), 1);
        assert_eq!(dst.duration_frames(), 30);
        let moved = &dst.clips()[0];
        assert_eq!(moved.orig_start_pts(), 100 * 1001);
        assert_eq!(moved.orig_end_pts(), 130 * 1001);
        assert_eq!(moved.handle_refs(), 3);
        Ok(())
    }

    #[test]
    fn test_cut_on_existing_boundary() -> Result<()> {
        let mut src = source(&["a.mp4", "b.mp4"])?;
        let mut dst = Sequence::new(params().sequence_config())?;

        cut_remove_insert(&mut src, &mut dst, 0, 300)?;
        assert_eq!(src.len(), 1);
        assert_eq!(src.duration_frames(), 300);
        assert_eq!(dst.duration_frames(), 300);
        Ok(())
    }

    #[test]
    fn test_random_edit_reaches_duration() -> Result<()> {
        let mut src = source(&["a.mp4", "b.mp4", "c.mp4"])?;
        let mut dst = Sequence::new(params().sequence_config())?;
        let before = src.duration_frames();

        random_edit(&mut src, &mut dst, &params(), &mut StdRng::seed_from_u64(42))?;
        assert!(dst.duration_frames() > 120);
        assert_eq!(src.duration_frames() + dst.duration_frames(), before);
        assert!(src.is_contiguous());
        assert!(dst.is_contiguous());
        Ok(())
    }

    #[test]
    fn test_random_edit_runs_out_of_material() -> Result<()> {
        let mut src = source(&["a.mp4"])?;
        let mut dst = Sequence::new(params().sequence_config())?;

        let result = random_edit(
            &mut src,
            &mut dst,
            &params().with_duration(1000),
            &mut StdRng::seed_from_u64(1),
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_cut_snaps_to_edge_between_frames() -> Result<()> {
        let mut src = pal_source(&["a.mp4", "b.mp4"])?;
        let mut dst = Sequence::new(params().sequence_config())?;
        let second = src.clips()[1].id();

        // Frame 120 is 100 ticks of a 1000 tick source frame into the second clip
        assert_eq!(src.locate_clip_at_frame(120).map(|(c, r)| (c.id(), r)), Some((second, 100)));

        cut_remove_insert(&mut src, &mut dst, 120, 150)?;
        assert_eq!(src.len(), 2);
        assert!(src.is_contiguous());

        assert_eq!(dst.len(), 1);
        assert_eq!(dst.duration_frames(), 30);
        let moved = &dst.clips()[0];
        assert_eq!(moved.orig_start_pts(), 0);
        assert_eq!(moved.orig_end_pts(), 25125);
        Ok(())
    }

    #[test]
    fn test_cut_snaps_to_clip_end() -> Result<()> {
        let mut src = pal_source(&["a.mp4", "b.mp4"])?;
        let mut dst = Sequence::new(params().sequence_config())?;

        // Frame 119 leaves less than a source frame of the first clip
        cut_remove_insert(&mut src, &mut dst, 90, 119)?;
        let moved = &dst.clips()[0];
        assert_eq!(moved.orig_end_pts(), 100_000);
        assert!(src.is_contiguous());
        Ok(())
    }

    #[test]
    fn test_random_edit_across_frame_rates() -> Result<()> {
        let edit = params().with_duration(90);

        for seed in 0..8 {
            let mut src = pal_source(&["a.mp4", "b.mp4", "c.mp4"])?;
            let mut dst = Sequence::new(params().sequence_config())?;

            random_edit(&mut src, &mut dst, &edit, &mut StdRng::seed_from_u64(seed))?;
            assert!(dst.duration_frames() > 90);
            assert!(src.is_contiguous());
            assert!(dst.is_contiguous());
            for clip in src.clips().iter().chain(dst.clips()) {
                assert!(clip.duration_pts() >= clip.frame_duration(), "{clip} is under a frame");
            }
        }
        Ok(())
    }
}
