//! Construction of the ffmpeg argument vector for a looping RTMP push.

/// Fixed ingest endpoint; the stream key is appended as the last path segment.
pub const INGEST_BASE: &str = "rtmp://a.rtmp.youtube.com/live2";

/// Keyframe interval in frames.
const GOP_SIZE: &str = "60";

/// x264 speed/quality tiers, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityPreset {
    Ultrafast,
    Superfast,
    #[default]
    Veryfast,
    Fast,
    Medium,
}

impl QualityPreset {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityPreset::Ultrafast => "ultrafast",
            QualityPreset::Superfast => "superfast",
            QualityPreset::Veryfast => "veryfast",
            QualityPreset::Fast => "fast",
            QualityPreset::Medium => "medium",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ultrafast" => Some(QualityPreset::Ultrafast),
            "superfast" => Some(QualityPreset::Superfast),
            "veryfast" => Some(QualityPreset::Veryfast),
            "fast" => Some(QualityPreset::Fast),
            "medium" => Some(QualityPreset::Medium),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub vertical_mode: bool,
    pub preset: QualityPreset,
    pub video_bitrate: String,
    pub audio_bitrate: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            vertical_mode: false,
            preset: QualityPreset::default(),
            video_bitrate: "2500k".to_string(),
            audio_bitrate: "128k".to_string(),
        }
    }
}

/// Builds the full ffmpeg argument vector: read the source once, loop it
/// forever at native rate, re-encode to h264/aac at the configured bitrates
/// and mux as FLV to the RTMP ingest URL.
pub fn build_stream_args(source: &str, stream_key: &str, config: &StreamConfig) -> Vec<String> {
    let bitrate = config.video_bitrate.as_str();
    let mut args: Vec<String> = [
        "-re",
        "-stream_loop",
        "-1",
        "-i",
        source,
        "-c:v",
        "libx264",
        "-preset",
        config.preset.as_str(),
        "-b:v",
        bitrate,
        "-maxrate",
        bitrate,
        "-bufsize",
        &buffer_size(bitrate),
        "-g",
        GOP_SIZE,
        "-keyint_min",
        GOP_SIZE,
        "-c:a",
        "aac",
        "-b:a",
        &config.audio_bitrate,
        "-f",
        "flv",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if config.vertical_mode {
        args.push("-vf".to_string());
        args.push("scale=720:1280".to_string());
    }

    args.push(format!("{}/{}", INGEST_BASE, stream_key));
    args
}

/// Rate-control buffer is twice the target bitrate. Values that are not a
/// plain `<n>k` pass through unchanged.
fn buffer_size(bitrate: &str) -> String {
    let digits = bitrate.trim_end_matches(['k', 'K']);
    if digits.len() == bitrate.len() {
        return bitrate.to_string();
    }
    match digits.parse::<u32>() {
        Ok(n) => format!("{}k", n * 2),
        Err(_) => bitrate.to_string(),
    }
}
