// StreamStats Model
// Statistics parsed from relay transcoder diagnostic output

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Latest statistics snapshot for one destination's relay child.
///
/// The transcoder reports progress on stderr as fused lines like:
/// `frame= 1234 fps= 60 q=-1.0 size=   12345kB time=00:01:23.45 bitrate=1234.5kbits/s speed=1.0x`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    /// Destination this snapshot belongs to
    pub destination_id: String,

    /// Current frame number
    pub frame: u64,

    /// Frames per second
    pub fps: f64,

    /// Encoder quality factor (`-1` in stream-copy mode)
    pub quality: f64,

    /// Output size in kB
    pub size: u64,

    /// Elapsed stream time in seconds
    pub time_seconds: f64,

    /// Current bitrate in kbit/s
    pub bitrate: f64,

    /// Relay speed relative to real time (1.0 = realtime)
    pub speed: f64,

    /// Video resolution, when the transcoder has printed stream info
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,

    /// Video codec name, when the transcoder has printed stream info
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
}

/// Fields recognized on a single diagnostic line. All optional; a line with
/// no recognized field parses to `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineStats {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub quality: Option<f64>,
    pub size: Option<u64>,
    pub time_seconds: Option<f64>,
    pub bitrate: Option<f64>,
    pub speed: Option<f64>,
    pub resolution: Option<String>,
    pub codec: Option<String>,
}

impl LineStats {
    fn is_empty(&self) -> bool {
        self.frame.is_none()
            && self.fps.is_none()
            && self.quality.is_none()
            && self.size.is_none()
            && self.time_seconds.is_none()
            && self.bitrate.is_none()
            && self.speed.is_none()
            && self.resolution.is_none()
            && self.codec.is_none()
    }
}

fn fused_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"frame=\s*(\d+)\s+fps=\s*([\d.]+)\s+q=\s*(-?[\d.]+)\s+size=\s*(\d+)kB\s+time=(\d+):(\d+):(\d+(?:\.\d+)?)\s+bitrate=\s*([\d.]+)kbits/s(?:\s+speed=\s*([\d.]+)x)?",
        )
        .expect("fused stats regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatField {
    Frame,
    Fps,
    Quality,
    Size,
    Time,
    Bitrate,
    Speed,
}

fn field_res() -> &'static [(StatField, Regex)] {
    static RES: OnceLock<Vec<(StatField, Regex)>> = OnceLock::new();
    RES.get_or_init(|| {
        vec![
            (StatField::Frame, Regex::new(r"frame=\s*(\d+)").expect("frame regex")),
            (StatField::Fps, Regex::new(r"fps=\s*([\d.]+)").expect("fps regex")),
            (StatField::Quality, Regex::new(r"q=\s*(-?[\d.]+)").expect("q regex")),
            (StatField::Size, Regex::new(r"size=\s*(\d+)kB").expect("size regex")),
            (
                StatField::Time,
                Regex::new(r"time=(\d+):(\d+):(\d+(?:\.\d+)?)").expect("time regex"),
            ),
            (
                StatField::Bitrate,
                Regex::new(r"bitrate=\s*([\d.]+)kbits/s").expect("bitrate regex"),
            ),
            (StatField::Speed, Regex::new(r"speed=\s*([\d.]+)x").expect("speed regex")),
        ]
    })
}

fn stream_info_res() -> &'static (Regex, Regex) {
    static RES: OnceLock<(Regex, Regex)> = OnceLock::new();
    RES.get_or_init(|| {
        (
            Regex::new(r"Video:\s*(\w+)").expect("codec regex"),
            Regex::new(r"(\d{2,5})x(\d{2,5})").expect("resolution regex"),
        )
    })
}

/// Parse a single line of transcoder diagnostic output.
///
/// Recognizes the fused progress line first, then falls back to matching each
/// field individually, then to stream-info lines carrying codec/resolution.
/// Returns `None` when nothing on the line is recognized.
pub fn parse_stats_line(line: &str) -> Option<LineStats> {
    let mut out = LineStats::default();

    if let Some(caps) = fused_re().captures(line) {
        out.frame = caps.get(1).and_then(|m| m.as_str().parse().ok());
        out.fps = caps.get(2).and_then(|m| m.as_str().parse().ok());
        out.quality = caps.get(3).and_then(|m| m.as_str().parse().ok());
        out.size = caps.get(4).and_then(|m| m.as_str().parse().ok());
        out.time_seconds = parse_time(
            caps.get(5).map_or("", |m| m.as_str()),
            caps.get(6).map_or("", |m| m.as_str()),
            caps.get(7).map_or("", |m| m.as_str()),
        );
        out.bitrate = caps.get(8).and_then(|m| m.as_str().parse().ok());
        out.speed = caps.get(9).and_then(|m| m.as_str().parse().ok());
        return Some(out);
    }

    for (field, re) in field_res() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        match field {
            StatField::Frame => out.frame = caps.get(1).and_then(|m| m.as_str().parse().ok()),
            StatField::Fps => out.fps = caps.get(1).and_then(|m| m.as_str().parse().ok()),
            StatField::Quality => out.quality = caps.get(1).and_then(|m| m.as_str().parse().ok()),
            StatField::Size => out.size = caps.get(1).and_then(|m| m.as_str().parse().ok()),
            StatField::Time => {
                out.time_seconds = parse_time(
                    caps.get(1).map_or("", |m| m.as_str()),
                    caps.get(2).map_or("", |m| m.as_str()),
                    caps.get(3).map_or("", |m| m.as_str()),
                );
            }
            StatField::Bitrate => out.bitrate = caps.get(1).and_then(|m| m.as_str().parse().ok()),
            StatField::Speed => out.speed = caps.get(1).and_then(|m| m.as_str().parse().ok()),
        }
    }

    // Stream-info lines ("Stream #0:0: Video: h264 ..., 1920x1080 ...")
    if line.contains("Video:") {
        let (codec_re, res_re) = stream_info_res();
        if let Some(caps) = codec_re.captures(line) {
            out.codec = caps.get(1).map(|m| m.as_str().to_string());
        }
        if let Some(caps) = res_re.captures(line) {
            out.resolution = Some(format!(
                "{}x{}",
                caps.get(1).map_or("", |m| m.as_str()),
                caps.get(2).map_or("", |m| m.as_str()),
            ));
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn parse_time(hours: &str, minutes: &str, seconds: &str) -> Option<f64> {
    let h: f64 = hours.parse().ok()?;
    let m: f64 = minutes.parse().ok()?;
    let s: f64 = seconds.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

impl StreamStats {
    pub fn new(destination_id: impl Into<String>) -> Self {
        Self {
            destination_id: destination_id.into(),
            ..Default::default()
        }
    }

    /// Merge one parsed line into the snapshot. Only the latest values are
    /// retained; fields absent from the line keep their previous value.
    pub fn apply(&mut self, line: &LineStats) {
        if let Some(frame) = line.frame {
            self.frame = frame;
        }
        if let Some(fps) = line.fps {
            self.fps = fps;
        }
        if let Some(quality) = line.quality {
            self.quality = quality;
        }
        if let Some(size) = line.size {
            self.size = size;
        }
        if let Some(time) = line.time_seconds {
            self.time_seconds = time;
        }
        if let Some(bitrate) = line.bitrate {
            self.bitrate = bitrate;
        }
        if let Some(speed) = line.speed {
            self.speed = speed;
        }
        if let Some(ref resolution) = line.resolution {
            self.resolution = Some(resolution.clone());
        }
        if let Some(ref codec) = line.codec {
            self.codec = Some(codec.clone());
        }
    }
}

/// The last snapshot in a sequence, if any.
pub fn latest(samples: &[StreamStats]) -> Option<StreamStats> {
    samples.last().cloned()
}

/// Arithmetic mean over fps/bitrate/speed; frame, time, size, resolution and
/// codec are carried forward from the latest sample rather than averaged.
pub fn mean(samples: &[StreamStats]) -> Option<StreamStats> {
    let last = samples.last()?;
    let n = samples.len() as f64;
    let mut out = last.clone();
    out.fps = samples.iter().map(|s| s.fps).sum::<f64>() / n;
    out.bitrate = samples.iter().map(|s| s.bitrate).sum::<f64>() / n;
    out.speed = samples.iter().map(|s| s.speed).sum::<f64>() / n;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fused_line() {
        let line = "frame= 1234 fps= 60 q=-1.0 size=   12345kB time=00:01:23.45 bitrate=1234.5kbits/s speed=1.01x";
        let stats = parse_stats_line(line).unwrap();
        assert_eq!(stats.frame, Some(1234));
        assert_eq!(stats.fps, Some(60.0));
        assert_eq!(stats.quality, Some(-1.0));
        assert_eq!(stats.size, Some(12345));
        assert!((stats.time_seconds.unwrap() - 83.45).abs() < 1e-9);
        assert_eq!(stats.bitrate, Some(1234.5));
        assert_eq!(stats.speed, Some(1.01));
    }

    #[test]
    fn test_time_conversion() {
        let line = "time=01:02:03.50";
        let stats = parse_stats_line(line).unwrap();
        let expected = 3600.0 + 2.0 * 60.0 + 3.5;
        assert!((stats.time_seconds.unwrap() - expected).abs() < 1e-9);
        assert!(stats.time_seconds.unwrap() >= 0.0);
    }

    #[test]
    fn test_individual_field_fallback() {
        let stats = parse_stats_line("bitrate= 2500.0kbits/s").unwrap();
        assert_eq!(stats.bitrate, Some(2500.0));
        assert_eq!(stats.frame, None);

        let stats = parse_stats_line("speed=0.998x").unwrap();
        assert_eq!(stats.speed, Some(0.998));
    }

    #[test]
    fn test_stream_info_line() {
        let line = "  Stream #0:0: Video: h264 (High), yuv420p, 1920x1080, 60 fps";
        let stats = parse_stats_line(line).unwrap();
        assert_eq!(stats.codec.as_deref(), Some("h264"));
        assert_eq!(stats.resolution.as_deref(), Some("1920x1080"));
    }

    #[test]
    fn test_unrecognized_line_is_none() {
        assert!(parse_stats_line("Press [q] to stop, [?] for help").is_none());
        assert!(parse_stats_line("").is_none());
    }

    #[test]
    fn test_apply_carries_forward() {
        let mut snapshot = StreamStats::new("a");
        snapshot.apply(
            &parse_stats_line(
                "frame= 10 fps= 30 q=-1.0 size= 100kB time=00:00:01.00 bitrate= 900.0kbits/s speed=1.0x",
            )
            .unwrap(),
        );
        snapshot.apply(&parse_stats_line("bitrate= 950.0kbits/s").unwrap());

        // Bitrate updated, frame retained from the earlier line
        assert_eq!(snapshot.bitrate, 950.0);
        assert_eq!(snapshot.frame, 10);
    }

    #[test]
    fn test_mean_aggregation() {
        let mut a = StreamStats::new("a");
        a.fps = 30.0;
        a.bitrate = 1000.0;
        a.speed = 1.0;
        a.frame = 10;
        let mut b = StreamStats::new("a");
        b.fps = 60.0;
        b.bitrate = 2000.0;
        b.speed = 0.5;
        b.frame = 20;

        let avg = mean(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(avg.fps, 45.0);
        assert_eq!(avg.bitrate, 1500.0);
        assert_eq!(avg.speed, 0.75);
        // Latest carried forward, not averaged
        assert_eq!(avg.frame, 20);

        assert_eq!(latest(&[a, b.clone()]).unwrap(), b);
        assert!(latest(&[]).is_none());
        assert!(mean(&[]).is_none());
    }
}
