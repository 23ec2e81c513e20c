use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, error};

/// Container facts needed to sample a video.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub duration_secs: Option<f64>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

pub fn tools_available() -> bool {
    ["ffmpeg", "ffprobe"].iter().all(|bin| {
        Command::new(bin)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

pub fn probe_video(path: &Path, timeout: Duration) -> Result<VideoProbe> {
    let args = vec![
        "-v".to_string(),
        "error".to_string(),
        "-select_streams".to_string(),
        "v:0".to_string(),
        "-show_entries".to_string(),
        "stream=width,height,duration:format=duration".to_string(),
        "-of".to_string(),
        "json".to_string(),
        path.to_string_lossy().to_string(),
    ];
    let output = run_with_timeout("ffprobe", &args, timeout)?;
    if !output.status.success() {
        bail!("ffprobe exited with {}: {}", output.status, stderr_preview(&output.stderr));
    }
    parse_probe(&output.stdout)
}

pub(crate) fn parse_probe(json: &[u8]) -> Result<VideoProbe> {
    let parsed: ProbeOutput = serde_json::from_slice(json).context("unreadable ffprobe output")?;
    let stream = parsed.streams.into_iter().next().context("no video stream")?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => bail!("video stream has no dimensions"),
    };
    let parse_secs = |s: Option<String>| s.and_then(|v| v.parse::<f64>().ok()).filter(|d| d.is_finite() && *d > 0.0);
    let duration_secs = parse_secs(parsed.format.and_then(|f| f.duration)).or_else(|| parse_secs(stream.duration));
    Ok(VideoProbe { width, height, duration_secs })
}

/// Start ffmpeg decoding `path` to raw rgb24 frames on stdout, resampled to
/// `fps` and scaled to exactly `width` x `height`.
pub fn spawn_rawvideo(path: &Path, fps: f32, width: u32, height: u32) -> Result<Child> {
    let filter = format!("fps={},scale={}:{}", fps, width, height);
    debug!("spawning ffmpeg for {} ({})", path.display(), filter);
    Command::new("ffmpeg")
        .args(["-nostdin", "-v", "error", "-i"])
        .arg(path)
        .args(["-an", "-vf", &filter, "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn ffmpeg for {}", path.display()))
}

/// Run `bin` to completion, killing it once `timeout` elapses. Output pipes
/// are drained on helper threads so a chatty child cannot block.
pub fn run_with_timeout(bin: &str, args: &[String], timeout: Duration) -> Result<Output> {
    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {}", bin))?;

    let mut stdout = child.stdout.take().context("missing stdout handle")?;
    let mut stderr = child.stderr.take().context("missing stderr handle")?;
    let out_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let err_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            let _ = child.wait();
            let _ = out_reader.join();
            let stderr = err_reader.join().unwrap_or_default();
            error!("{} timed out after {:?}: {}", bin, timeout, stderr_preview(&stderr));
            bail!("{} timed out after {:?}", bin, timeout);
        }
        thread::sleep(Duration::from_millis(20));
    };

    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();
    debug!("{} finished in {:?} ({} bytes out)", bin, start.elapsed(), stdout.len());
    Ok(Output { status, stdout, stderr })
}

fn stderr_preview(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).take(3).collect();
    if lines.is_empty() {
        "no stderr".to_string()
    } else {
        lines.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_format_duration_first() {
        let json = br#"{"streams":[{"width":1920,"height":1080,"duration":"9.9"}],"format":{"duration":"10.5"}}"#;
        let probe = parse_probe(json).unwrap();
        assert_eq!(probe, VideoProbe { width: 1920, height: 1080, duration_secs: Some(10.5) });
    }

    #[test]
    fn falls_back_to_stream_duration() {
        let json = br#"{"streams":[{"width":640,"height":360,"duration":"3.0"}],"format":{"duration":"N/A"}}"#;
        assert_eq!(parse_probe(json).unwrap().duration_secs, Some(3.0));
        let json = br#"{"streams":[{"width":640,"height":360}]}"#;
        assert_eq!(parse_probe(json).unwrap().duration_secs, None);
    }

    #[test]
    fn rejects_files_without_video() {
        assert!(parse_probe(br#"{"streams":[],"format":{"duration":"1.0"}}"#).is_err());
        assert!(parse_probe(br#"{"streams":[{"width":0,"height":0}]}"#).is_err());
        assert!(parse_probe(b"not json").is_err());
    }
}
