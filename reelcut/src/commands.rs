use crate::{
    cli::{EncodeArgs, SequenceArgs, SpliceArgs},
    config::{EncodeSettings, Settings},
    splice::{self, SpliceParams},
};
use anyhow::{Context, Result, bail};
use rand::Rng;
use std::{
    io::Write,
    path::{Path, PathBuf},
    rc::Rc,
};
use timeline::{
    Backend, Clip, CodecChoice, InsertOrder, MediaHandle, MediaKind, OutputContext, OutputParams,
    Sequence, SequenceConfig, SequenceOutcome,
};

/// Backend able to read `sources`.
#[cfg(feature = "ffmpeg")]
pub fn open_backend(_sources: &[PathBuf]) -> Result<Rc<dyn Backend>> {
    Ok(Rc::new(timeline::backend::FfmpegBackend::new()?))
}

/// Backend able to read `sources`.
///
/// Without ffmpeg every source is stood in for by a generated clip and outputs stay in memory.
#[cfg(not(feature = "ffmpeg"))]
pub fn open_backend(sources: &[PathBuf]) -> Result<Rc<dyn Backend>> {
    use timeline::backend::{SyntheticBackend, SyntheticMedia};

    log::warn!("built without the ffmpeg feature, using synthetic sources");
    let backend = SyntheticBackend::new();
    for source in sources {
        let modified = std::fs::metadata(source)
            .and_then(|meta| meta.modified())
            .ok();
        backend.register(source, SyntheticMedia::default().with_modified(modified));
    }
    Ok(Rc::new(backend))
}

pub fn sequence_config(settings: &Settings, args: &SequenceArgs) -> Result<SequenceConfig> {
    let fps = args.fps.unwrap_or(settings.fps);
    let sample_rate = args.sample_rate.unwrap_or(settings.sample_rate);
    settings
        .clone()
        .with_fps(fps)
        .with_sample_rate(sample_rate)
        .validate()?;

    let order = if args.chronological || settings.chronological {
        InsertOrder::Chronological
    } else {
        InsertOrder::Position
    };

    Ok(SequenceConfig::from_rates(fps, sample_rate)
        .with_insert_order(order)
        .with_close_clips(args.close_clips || settings.close_clips))
}

/// Lay out the `--clip`s, then apply every `--cut` and finally every `--delete`.
pub fn build_sequence(
    backend: &Rc<dyn Backend>,
    settings: &Settings,
    args: &SequenceArgs,
) -> Result<Sequence> {
    let config = sequence_config(settings, args)?;
    let chronological = matches!(config.insert_order, InsertOrder::Chronological);
    let mut seq = Sequence::new(config)?;

    for spec in &args.clips {
        let mut clip = Clip::open_file(backend.clone(), &spec.path)
            .with_context(|| format!("open {} failed", spec.path.display()))?;
        if let Some((start, end)) = spec.range {
            clip.set_bounds(start, end)
                .with_context(|| format!("trim {} to [{start}, {end}) failed", spec.path.display()))?;
        }

        if chronological {
            seq.insert_sorted(clip);
        } else {
            seq.append(clip);
        }
    }

    for frame in &args.cuts {
        seq.cut_clip_at_frame(*frame)
            .with_context(|| format!("cut at frame {frame} failed"))?;
    }

    // Indexes refer to the layout after cutting, resolve them all before deleting any
    let mut doomed = vec![];
    for index in &args.deletes {
        match seq.clips().get(*index) {
            Some(clip) => doomed.push(clip.id()),
            None => bail!("no clip at index {index}, sequence has {}", seq.len()),
        }
    }
    for id in doomed {
        seq.ripple_delete(id)?;
    }

    log::info!("{seq}");
    Ok(seq)
}

pub fn probe(backend: &Rc<dyn Backend>, files: &[PathBuf], out: &mut impl Write) -> Result<()> {
    for file in files {
        let handle = MediaHandle::open_shared(backend.clone(), file)
            .with_context(|| format!("open {} failed", file.display()))?;
        let handle = handle.borrow();
        let video = handle.video_params()?;

        writeln!(out, "{}", file.display())?;
        writeln!(
            out,
            "  video: stream {} {} {}x{} {}, tb {}, {} frames of {} ({:.3} fps), duration {}",
            handle.video_stream_index().unwrap_or_default(),
            video.codec_name,
            video.width,
            video.height,
            video.pixel_format,
            handle.video_time_base(),
            handle.frame_count(),
            handle.frame_duration(),
            handle.fps(),
            handle.duration(),
        )?;

        match handle.audio_params()? {
            Some(audio) => writeln!(
                out,
                "  audio: stream {} {} {} Hz {} ch {}, tb {}",
                handle.audio_stream_index().unwrap_or_default(),
                audio.codec_name,
                audio.sample_rate,
                audio.channels,
                audio.sample_format,
                handle.audio_time_base(),
            )?,
            None => writeln!(out, "  audio: none")?,
        }
    }
    Ok(())
}

fn kind_name(kind: Option<MediaKind>) -> String {
    kind.map_or_else(|| "other".to_string(), |kind| kind.to_string())
}

fn ts_name(ts: Option<i64>) -> String {
    ts.map_or_else(|| "-".to_string(), |ts| ts.to_string())
}

/// Print one pass of packets with their source and sequence timestamps. Returns the packet count.
pub fn dump_packets(seq: &mut Sequence, out: &mut impl Write) -> Result<usize> {
    let mut count = 0;
    while let SequenceOutcome::Ready(item) = seq.read_packet()? {
        let packet = item.packet;
        let seq_ts = match (seq.clip(item.clip), packet.timestamp(), packet.kind) {
            (Some(clip), Some(ts), Some(MediaKind::Video)) => Some(seq.video_pkt_to_seq_ts(clip, ts)),
            (Some(clip), Some(ts), Some(MediaKind::Audio)) => Some(seq.audio_pkt_to_seq_ts(clip, ts)),
            _ => None,
        };

        writeln!(
            out,
            "clip {} {} pts {} dts {} seq {}{}",
            item.clip,
            kind_name(packet.kind),
            ts_name(packet.pts),
            ts_name(packet.dts),
            ts_name(seq_ts),
            if packet.key { " key" } else { "" },
        )?;
        count += 1;
    }
    Ok(count)
}

/// Print one pass of decoded frames in sequence time. Returns the frame count.
pub fn dump_frames(seq: &mut Sequence, out: &mut impl Write) -> Result<usize> {
    let mut count = 0;
    while let SequenceOutcome::Ready(frame) = seq.read_frame()? {
        writeln!(
            out,
            "{} pts {}{}",
            frame.kind,
            ts_name(frame.pts),
            if frame.key_frame { " key" } else { "" },
        )?;
        count += 1;
    }
    Ok(count)
}

/// Output parameters modelled on the first clip of `seq`.
pub fn output_params(path: &Path, seq: &Sequence, encode: &EncodeSettings) -> Result<OutputParams> {
    let Some(exemplar) = seq.clips().first() else {
        bail!("nothing to encode, the sequence is empty");
    };

    let video_codec = encode.video_codec.parse::<CodecChoice>()?;
    let audio_codec = encode.audio_codec.parse::<CodecChoice>()?;

    Ok(OutputParams::from_exemplar(path, exemplar, seq)?
        .with_video_codec(video_codec)
        .with_video_bit_rate(encode.video_bit_rate)
        .with_audio_codec(audio_codec)
        .with_audio_bit_rate(encode.audio_bit_rate))
}

/// Encode `seq` into `path`. Returns the packets written.
pub fn write_sequence(
    backend: &Rc<dyn Backend>,
    seq: &mut Sequence,
    path: &Path,
    encode: &EncodeSettings,
) -> Result<usize> {
    let params = output_params(path, seq, encode)?;
    let mut output = OutputContext::open(&**backend, params)
        .with_context(|| format!("open output {} failed", path.display()))?;

    let written = output
        .write_sequence(seq)
        .with_context(|| format!("write {} failed", path.display()))?;
    log::info!("wrote {written} packets to {}", path.display());
    Ok(written)
}

fn encode_settings(settings: &Settings, args: &EncodeArgs) -> EncodeSettings {
    let mut encode = settings.encode.clone();
    if let Some(codec) = &args.video_codec {
        encode.video_codec = codec.clone();
    }
    if let Some(rate) = args.video_bitrate {
        encode.video_bit_rate = rate.0;
    }
    if let Some(codec) = &args.audio_codec {
        encode.audio_codec = codec.clone();
    }
    if let Some(rate) = args.audio_bitrate {
        encode.audio_bit_rate = rate.0;
    }
    encode
}

pub fn encode(backend: &Rc<dyn Backend>, settings: &Settings, args: &EncodeArgs) -> Result<usize> {
    let mut seq = build_sequence(backend, settings, &args.sequence)?;
    write_sequence(backend, &mut seq, &args.output, &encode_settings(settings, args))
}

pub fn splice_params(settings: &Settings, args: &SpliceArgs) -> SpliceParams {
    SpliceParams {
        output: args.output.clone(),
        fps: args.fps.unwrap_or(settings.fps),
        sample_rate: args.sample_rate.unwrap_or(settings.sample_rate),
        source_dir: args.source_dir.clone(),
        duration: args.duration.unwrap_or(settings.splice.duration),
        cut_len_avg: args.cut_len_avg.unwrap_or(settings.splice.cut_len_avg),
        cut_len_var: args.cut_len_var.unwrap_or(settings.splice.cut_len_var),
    }
}

/// Random edit of `files` written to `params.output`. Returns the edited sequence.
pub fn splice(
    backend: &Rc<dyn Backend>,
    files: &[PathBuf],
    params: &SpliceParams,
    encode: &EncodeSettings,
    rng: &mut impl Rng,
) -> Result<Sequence> {
    params.validate()?;

    let mut source = splice::load_sources(backend, files, params.sequence_config())?;
    log::info!("source {source}");

    let mut edit = Sequence::new(params.sequence_config())?;
    splice::random_edit(&mut source, &mut edit, params, rng)?;
    log::info!("edit {edit}");

    write_sequence(backend, &mut edit, &params.output, encode)?;
    Ok(edit)
}

pub fn run_splice(settings: &Settings, args: &SpliceArgs) -> Result<()> {
    use rand::{SeedableRng, rngs::StdRng};

    let params = splice_params(settings, args);
    let files = splice::scan_sources(&params.source_dir)?;
    let backend = open_backend(&files)?;

    let seed = args
        .seed
        .or(settings.splice.seed)
        .unwrap_or_else(|| rand::rng().random());
    log::info!("random splice seed {seed}");

    splice(
        &backend,
        &files,
        &params,
        &settings.encode,
        &mut StdRng::seed_from_u64(seed),
    )?;
    Ok(())
}
