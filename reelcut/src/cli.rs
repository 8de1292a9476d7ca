//! Command line definition.

use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, str::FromStr};

#[derive(Parser, Debug)]
#[command(name = "reelcut")]
#[command(version)]
#[command(about = "Cut, splice and re-encode video clips on a frame accurate timeline")]
pub struct Cli {
    /// TOML settings file, created with defaults when missing
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print stream timing of source files
    Probe {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Dump every packet of one pass over a sequence
    Packets(SequenceArgs),

    /// Dump every decoded frame of one pass over a sequence
    Frames(SequenceArgs),

    /// Encode a sequence to a file
    Encode(EncodeArgs),

    /// Build a random edit out of a directory of sources and encode it
    Splice(SpliceArgs),
}

/// Flags that describe a sequence.
#[derive(Args, Debug, Clone, Default)]
pub struct SequenceArgs {
    /// Sequence frame rate
    #[arg(long)]
    pub fps: Option<f64>,

    /// Sequence audio sample rate
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Source file, optionally trimmed to frames [START, END)
    #[arg(long = "clip", value_name = "PATH[:START:END]", required = true)]
    pub clips: Vec<ClipSpec>,

    /// Order clips by file modification time instead of command line order
    #[arg(long)]
    pub chronological: bool,

    /// Split the clip under this sequence frame
    #[arg(long = "cut", value_name = "FRAME")]
    pub cuts: Vec<i64>,

    /// Ripple delete the clip at this index, counted after cutting
    #[arg(long = "delete", value_name = "INDEX")]
    pub deletes: Vec<usize>,

    /// Close each source once it has been read
    #[arg(long)]
    pub close_clips: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EncodeArgs {
    #[command(flatten)]
    pub sequence: SequenceArgs,

    #[arg(short, long)]
    pub output: PathBuf,

    /// Video encoder name, or `auto` for the container default
    #[arg(long)]
    pub video_codec: Option<String>,

    /// Video bit rate in bits per second, or `auto`
    #[arg(long, value_parser = parse_bit_rate)]
    pub video_bitrate: Option<BitRate>,

    /// Audio encoder name, or `auto` for the container default
    #[arg(long)]
    pub audio_codec: Option<String>,

    /// Audio bit rate in bits per second, or `auto`
    #[arg(long, value_parser = parse_bit_rate)]
    pub audio_bitrate: Option<BitRate>,
}

#[derive(Args, Debug, Clone)]
pub struct SpliceArgs {
    #[arg(short, long)]
    pub output: PathBuf,

    /// Directory holding the source files
    #[arg(long)]
    pub source_dir: PathBuf,

    #[arg(long)]
    pub fps: Option<f64>,

    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Output length in frames
    #[arg(long)]
    pub duration: Option<i64>,

    /// Average cut length in frames
    #[arg(long)]
    pub cut_len_avg: Option<i64>,

    /// Maximum deviation from the average cut length
    #[arg(long)]
    pub cut_len_var: Option<i64>,

    /// Seed for a reproducible edit
    #[arg(long)]
    pub seed: Option<u64>,
}

/// A `--clip` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipSpec {
    pub path: PathBuf,
    /// Frames `[start, end)` of the source
    pub range: Option<(i64, i64)>,
}

impl FromStr for ClipSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty clip path".to_string());
        }

        // Paths may contain ':' themselves, only a trailing numeric pair is a range
        let mut parts = s.rsplitn(3, ':');
        let (end, start, path) = (parts.next(), parts.next(), parts.next());
        let range = match (path, start, end) {
            (Some(path), Some(start), Some(end)) if !path.is_empty() => {
                match (start.parse::<i64>(), end.parse::<i64>()) {
                    (Ok(start), Ok(end)) => Some((path, start, end)),
                    _ => None,
                }
            }
            _ => None,
        };

        match range {
            Some((_, start, end)) if start < 0 || end <= start => {
                Err(format!("clip range {start}:{end} is empty or negative"))
            }
            Some((path, start, end)) => Ok(ClipSpec {
                path: PathBuf::from(path),
                range: Some((start, end)),
            }),
            None => Ok(ClipSpec {
                path: PathBuf::from(s),
                range: None,
            }),
        }
    }
}

/// `None` lets the encoder choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRate(pub Option<usize>);

pub fn parse_bit_rate(s: &str) -> Result<BitRate, String> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(BitRate(None));
    }

    match s.parse::<usize>() {
        Ok(0) => Err("bit rate must be positive".to_string()),
        Ok(rate) => Ok(BitRate(Some(rate))),
        Err(e) => Err(format!("invalid bit rate `{s}`: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_spec() {
        assert_eq!(
            "a.mp4".parse::<ClipSpec>().unwrap(),
            ClipSpec {
                path: PathBuf::from("a.mp4"),
                range: None
            }
        );
        assert_eq!(
            "a.mp4:20:27".parse::<ClipSpec>().unwrap(),
            ClipSpec {
                path: PathBuf::from("a.mp4"),
                range: Some((20, 27))
            }
        );
        assert_eq!(
            "c:/videos/a.mp4:0:10".parse::<ClipSpec>().unwrap().path,
            PathBuf::from("c:/videos/a.mp4")
        );
        assert_eq!(
            "clip:one.mp4".parse::<ClipSpec>().unwrap().path,
            PathBuf::from("clip:one.mp4")
        );
        assert!("a.mp4:10:10".parse::<ClipSpec>().is_err());
        assert!("a.mp4:-1:10".parse::<ClipSpec>().is_err());
        assert!("".parse::<ClipSpec>().is_err());
    }

    #[test]
    fn test_bit_rate() {
        assert_eq!(parse_bit_rate("auto").unwrap(), BitRate(None));
        assert_eq!(parse_bit_rate("AUTO").unwrap(), BitRate(None));
        assert_eq!(parse_bit_rate("4000000").unwrap(), BitRate(Some(4_000_000)));
        assert!(parse_bit_rate("0").is_err());
        assert!(parse_bit_rate("fast").is_err());
    }

    #[test]
    fn test_parse_encode_command() {
        let cli = Cli::try_parse_from([
            "reelcut",
            "encode",
            "--clip",
            "a.mp4:20:27",
            "--clip",
            "b.mp4",
            "--cut",
            "3",
            "--delete",
            "1",
            "-o",
            "out.mp4",
            "--video-bitrate",
            "auto",
            "--audio-codec",
            "aac",
        ])
        .unwrap();

        let Command::Encode(args) = cli.command else {
            panic!("expected encode");
        };
        assert_eq!(args.sequence.clips.len(), 2);
        assert_eq!(args.sequence.cuts, vec![3]);
        assert_eq!(args.sequence.deletes, vec![1]);
        assert_eq!(args.video_bitrate, Some(BitRate(None)));
        assert_eq!(args.audio_codec.as_deref(), Some("aac"));
        assert_eq!(args.output, PathBuf::from("out.mp4"));
    }

    #[test]
    fn test_clip_required() {
        assert!(Cli::try_parse_from(["reelcut", "frames"]).is_err());
        assert!(Cli::try_parse_from(["reelcut", "probe"]).is_err());
    }
}
