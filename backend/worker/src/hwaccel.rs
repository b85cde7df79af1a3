//! Hardware acceleration detection and FFmpeg encoder selection
//!
//! Supports NVIDIA NVENC (h264_nvenc, hevc_nvenc, av1_nvenc), Intel/AMD
//! VAAPI via a DRM render node, and software fallback (libx264, libx265,
//! libsvtav1). Detection runs once at worker startup: each candidate
//! encoder must pass a tiny null-sink encode before it is trusted, because
//! FFmpeg listing an encoder does not mean the driver can run it.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccelType {
    None,
    Nvidia,
    Intel,
}

impl HwAccelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HwAccelType::None => "none",
            HwAccelType::Nvidia => "nvidia",
            HwAccelType::Intel => "intel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Hevc,
    Av1,
}

impl VideoCodec {
    pub fn parse(s: &str) -> Self {
        match s {
            "hevc" | "h265" => VideoCodec::Hevc,
            "av1" => VideoCodec::Av1,
            _ => VideoCodec::H264,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::Hevc => "hevc",
            VideoCodec::Av1 => "av1",
        }
    }
}

/// One usable encoder.
#[derive(Debug, Clone, Serialize)]
pub struct EncoderInfo {
    pub name: String,
    pub codec: VideoCodec,
    pub hwaccel_type: HwAccelType,
    pub is_hardware: bool,
}

/// Detected GPU capabilities, cached for the worker's lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct GpuCapabilities {
    pub hwaccel_type: HwAccelType,
    pub device_name: String,
    pub device_path: Option<String>,
    pub encoders: BTreeMap<VideoCodec, Vec<EncoderInfo>>,
    pub max_concurrent_sessions: usize,
    pub driver_version: Option<String>,
}

/// Encoder choice with the FFmpeg arguments it implies.
#[derive(Debug, Clone)]
pub struct EncoderSelection {
    pub encoder: EncoderInfo,
    /// Arguments placed before `-i`.
    pub input_args: Vec<String>,
    /// Codec and rate-control arguments placed after `-i`.
    pub output_args: Vec<String>,
    /// Scale filter for the target height.
    pub scale_filter: String,
}

/// Session limits for consumer NVIDIA GPUs; datacenter parts are
/// effectively unlimited.
const NVIDIA_SESSION_LIMITS: &[(&str, usize)] = &[
    ("RTX 40", 5),
    ("RTX 30", 3),
    ("RTX 20", 3),
    ("GTX 16", 2),
    ("GTX 10", 2),
    ("A100", 999),
    ("A40", 999),
    ("A30", 999),
    ("A10", 999),
    ("T4", 999),
    ("L4", 999),
    ("L40", 999),
    ("H100", 999),
];

fn nvidia_session_limit(gpu_name: &str) -> usize {
    for (model, limit) in NVIDIA_SESSION_LIMITS {
        if gpu_name.contains(model) {
            return *limit;
        }
    }
    3
}

async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Option<(bool, String)> {
    let child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Some((output.status.success(), text))
        }
        Ok(Err(_)) | Err(_) => None,
    }
}

/// Encoders FFmpeg was built with (names only; not yet proven to work).
async fn probe_ffmpeg_encoders() -> Vec<String> {
    let Some((ok, output)) =
        run_command("ffmpeg", &["-hide_banner", "-encoders"], Duration::from_secs(10)).await
    else {
        return Vec::new();
    };
    if !ok {
        return Vec::new();
    }

    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.starts_with('V') {
                line.split_whitespace().nth(1).map(str::to_string)
            } else {
                None
            }
        })
        .collect()
}

/// Prove an NVENC encoder works with a tiny null-sink encode.
/// NVENC needs at least 144x144 input; 256x256 stays clear of that.
async fn test_nvenc_encoder(encoder: &str) -> bool {
    let result = run_command(
        "ffmpeg",
        &[
            "-hide_banner", "-y", "-hwaccel", "cuda", "-f", "lavfi", "-i",
            "color=black:s=256x256:d=0.1", "-c:v", encoder, "-f", "null", "-",
        ],
        Duration::from_secs(15),
    )
    .await;

    match result {
        Some((true, _)) => true,
        Some((false, output)) => {
            warn!("NVENC encoder {encoder} test failed: {}", first_error_line(&output));
            false
        }
        None => false,
    }
}

async fn test_vaapi_encoder(encoder: &str, device: &str) -> bool {
    let result = run_command(
        "ffmpeg",
        &[
            "-hide_banner", "-y", "-vaapi_device", device, "-f", "lavfi", "-i",
            "color=black:s=256x256:d=0.1", "-vf", "format=nv12,hwupload", "-c:v", encoder,
            "-f", "null", "-",
        ],
        Duration::from_secs(15),
    )
    .await;

    match result {
        Some((true, _)) => true,
        Some((false, output)) => {
            warn!("VAAPI encoder {encoder} test failed: {}", first_error_line(&output));
            false
        }
        None => false,
    }
}

fn first_error_line(output: &str) -> &str {
    output
        .lines()
        .find(|l| !l.is_empty() && !l.starts_with('['))
        .unwrap_or("unknown error")
}

async fn detect_nvidia() -> Option<GpuCapabilities> {
    let (ok, output) = run_command(
        "nvidia-smi",
        &["--query-gpu=name,driver_version", "--format=csv,noheader"],
        Duration::from_secs(10),
    )
    .await?;
    if !ok || output.trim().is_empty() {
        return None;
    }

    let first_line = output.lines().next().unwrap_or_default();
    let mut parts = first_line.split(", ");
    let device_name = parts.next().unwrap_or("Unknown NVIDIA GPU").to_string();
    let driver_version = parts.next().map(str::to_string);

    let available = probe_ffmpeg_encoders().await;
    let mut encoders: BTreeMap<VideoCodec, Vec<EncoderInfo>> = BTreeMap::new();

    for (name, codec) in [
        ("h264_nvenc", VideoCodec::H264),
        ("hevc_nvenc", VideoCodec::Hevc),
        ("av1_nvenc", VideoCodec::Av1),
    ] {
        if available.iter().any(|e| e == name) && test_nvenc_encoder(name).await {
            encoders.entry(codec).or_default().push(EncoderInfo {
                name: name.to_string(),
                codec,
                hwaccel_type: HwAccelType::Nvidia,
                is_hardware: true,
            });
        }
    }

    if encoders.is_empty() {
        info!("NVIDIA GPU detected but no working NVENC encoders in FFmpeg");
        return None;
    }

    Some(GpuCapabilities {
        hwaccel_type: HwAccelType::Nvidia,
        max_concurrent_sessions: nvidia_session_limit(&device_name),
        device_name,
        device_path: None,
        encoders,
        driver_version,
    })
}

async fn detect_vaapi() -> Option<GpuCapabilities> {
    let render_device = first_render_node()?;
    let device_str = render_device.to_string_lossy().into_owned();

    let mut device_name = "VAAPI GPU".to_string();
    let mut driver_version = None;
    if let Some((ok, output)) = run_command(
        "vainfo",
        &["--display", "drm", "--device", &device_str],
        Duration::from_secs(10),
    )
    .await
    {
        if ok {
            for line in output.lines() {
                if line.to_lowercase().contains("driver version") {
                    driver_version = line.split(':').next_back().map(|s| s.trim().to_string());
                    if line.contains("Arc") || line.contains("DG2") {
                        device_name = "Intel Arc GPU".to_string();
                    } else if line.contains("iHD") || line.contains("Intel") {
                        device_name = "Intel QuickSync".to_string();
                    }
                    break;
                }
            }
        }
    }

    let available = probe_ffmpeg_encoders().await;
    let mut encoders: BTreeMap<VideoCodec, Vec<EncoderInfo>> = BTreeMap::new();

    for (name, codec) in [
        ("h264_vaapi", VideoCodec::H264),
        ("hevc_vaapi", VideoCodec::Hevc),
        ("av1_vaapi", VideoCodec::Av1),
    ] {
        if available.iter().any(|e| e == name) && test_vaapi_encoder(name, &device_str).await {
            encoders.entry(codec).or_default().push(EncoderInfo {
                name: name.to_string(),
                codec,
                hwaccel_type: HwAccelType::Intel,
                is_hardware: true,
            });
        }
    }

    if encoders.is_empty() {
        info!("Render node present but no working VAAPI encoders found");
        return None;
    }

    Some(GpuCapabilities {
        hwaccel_type: HwAccelType::Intel,
        device_name,
        device_path: Some(device_str),
        encoders,
        max_concurrent_sessions: 10,
        driver_version,
    })
}

fn first_render_node() -> Option<PathBuf> {
    let mut nodes: Vec<PathBuf> = std::fs::read_dir("/dev/dri")
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("renderD"))
                .unwrap_or(false)
        })
        .collect();
    nodes.sort();
    nodes.into_iter().next()
}

/// Detect GPU capabilities according to the configured accelerator type.
pub async fn detect_gpu_capabilities(hwaccel_type: &str) -> Option<GpuCapabilities> {
    match hwaccel_type {
        "none" => None,
        "nvidia" => detect_nvidia().await,
        "intel" => detect_vaapi().await,
        _ => {
            if let Some(caps) = detect_nvidia().await {
                Some(caps)
            } else {
                detect_vaapi().await
            }
        }
    }
}

/// Pick the best encoder for a target height: preferred codec on the GPU,
/// then H.264 on the GPU, then software.
pub fn select_encoder(
    gpu_caps: Option<&GpuCapabilities>,
    preferred_codec: VideoCodec,
    target_height: i32,
) -> EncoderSelection {
    if let Some(caps) = gpu_caps {
        if let Some(selection) = select_hardware_encoder(caps, preferred_codec, target_height) {
            return selection;
        }
    }
    select_software_encoder(preferred_codec, target_height)
}

fn select_hardware_encoder(
    caps: &GpuCapabilities,
    codec: VideoCodec,
    target_height: i32,
) -> Option<EncoderSelection> {
    let encoder = caps
        .encoders
        .get(&codec)
        .or_else(|| caps.encoders.get(&VideoCodec::H264))
        .and_then(|list| list.first())?
        .clone();

    match caps.hwaccel_type {
        HwAccelType::Nvidia => Some(build_nvenc_selection(encoder, target_height)),
        HwAccelType::Intel => Some(build_vaapi_selection(
            encoder,
            target_height,
            caps.device_path.as_deref(),
        )),
        HwAccelType::None => None,
    }
}

fn build_nvenc_selection(encoder: EncoderInfo, target_height: i32) -> EncoderSelection {
    let mut output_args = vec![
        "-c:v".into(),
        encoder.name.clone(),
        "-preset".into(),
        "p4".into(),
        "-tune".into(),
        "hq".into(),
        "-rc".into(),
        "vbr".into(),
        "-rc-lookahead".into(),
        "32".into(),
        "-bf".into(),
        "3".into(),
    ];
    if encoder.codec == VideoCodec::Hevc {
        // Apple players refuse HEVC without the hvc1 tag
        output_args.extend(["-tag:v".into(), "hvc1".into()]);
    }

    EncoderSelection {
        encoder,
        input_args: vec!["-hwaccel".into(), "cuda".into()],
        output_args,
        // Frames are scaled on the CPU; distro FFmpeg builds rarely ship
        // scale_npp/scale_cuda, and NVENC uploads frames itself.
        scale_filter: format!("scale=-2:{target_height}"),
    }
}

fn build_vaapi_selection(
    encoder: EncoderInfo,
    target_height: i32,
    device_path: Option<&str>,
) -> EncoderSelection {
    let device = device_path.unwrap_or("/dev/dri/renderD128").to_string();

    let mut output_args = vec!["-c:v".into(), encoder.name.clone()];
    match encoder.codec {
        VideoCodec::H264 => {
            output_args.extend(["-qp".into(), "23".into(), "-profile:v".into(), "high".into()])
        }
        VideoCodec::Hevc => output_args.extend([
            "-qp".into(),
            "25".into(),
            "-profile:v".into(),
            "main".into(),
            "-tag:v".into(),
            "hvc1".into(),
        ]),
        VideoCodec::Av1 => output_args.extend(["-qp".into(), "30".into()]),
    }

    EncoderSelection {
        encoder,
        input_args: vec!["-vaapi_device".into(), device],
        output_args,
        scale_filter: format!("format=nv12,hwupload,scale_vaapi=-2:{target_height}"),
    }
}

fn select_software_encoder(codec: VideoCodec, target_height: i32) -> EncoderSelection {
    let (name, codec_args): (&str, &[&str]) = match codec {
        VideoCodec::H264 => ("libx264", &["-preset", "medium", "-crf", "23"]),
        VideoCodec::Hevc => ("libx265", &["-preset", "medium", "-crf", "28", "-tag:v", "hvc1"]),
        VideoCodec::Av1 => ("libsvtav1", &["-preset", "6", "-crf", "30"]),
    };

    let mut output_args = vec!["-c:v".to_string(), name.to_string()];
    output_args.extend(codec_args.iter().map(|s| s.to_string()));

    EncoderSelection {
        encoder: EncoderInfo {
            name: name.to_string(),
            codec,
            hwaccel_type: HwAccelType::None,
            is_hardware: false,
        },
        input_args: Vec::new(),
        output_args,
        scale_filter: format!("scale=-2:{target_height}"),
    }
}

/// Concurrent quality encodes to run. A fixed configuration wins; otherwise
/// one session of headroom is reserved and the result capped at 3.
pub fn recommended_parallel_qualities(
    gpu_caps: Option<&GpuCapabilities>,
    configured: usize,
) -> usize {
    if configured > 0 {
        return configured;
    }
    match gpu_caps {
        Some(caps) => caps.max_concurrent_sessions.saturating_sub(1).clamp(1, 3),
        None => 1,
    }
}

/// Capability tags reported in heartbeats and stored on the worker row.
pub async fn worker_capabilities(gpu_caps: Option<&GpuCapabilities>) -> serde_json::Value {
    let mut caps = serde_json::json!({
        "hwaccel_enabled": gpu_caps.is_some(),
        "hwaccel_type": gpu_caps.map(|c| c.hwaccel_type.as_str()).unwrap_or("none"),
        "gpu_name": gpu_caps.map(|c| c.device_name.clone()),
        "supported_codecs": ["h264"],
        "encoders": {"h264": ["libx264"]},
        "max_concurrent_encode_sessions": 1,
    });

    if let Some((ok, output)) =
        run_command("ffmpeg", &["-version"], Duration::from_secs(5)).await
    {
        if ok {
            if let Some(version) = output
                .lines()
                .next()
                .and_then(|l| l.strip_prefix("ffmpeg version "))
                .and_then(|l| l.split_whitespace().next())
            {
                caps["ffmpeg_version"] = serde_json::json!(version);
            }
        }
    }

    if let Some(gpu) = gpu_caps {
        caps["max_concurrent_encode_sessions"] = serde_json::json!(gpu.max_concurrent_sessions);
        if let Some(driver) = &gpu.driver_version {
            caps["driver_version"] = serde_json::json!(driver);
        }
        if let Some(device) = &gpu.device_path {
            caps["vaapi_device"] = serde_json::json!(device);
        }

        let mut codecs = vec!["h264".to_string()];
        let mut encoders: BTreeMap<String, Vec<String>> = BTreeMap::new();
        encoders.insert("h264".into(), vec!["libx264".into()]);
        for (codec, list) in &gpu.encoders {
            let codec_name = codec.as_str().to_string();
            if !codecs.contains(&codec_name) {
                codecs.push(codec_name.clone());
            }
            let entry = encoders.entry(codec_name).or_default();
            for encoder in list {
                entry.insert(0, encoder.name.clone());
            }
        }
        codecs.sort();
        caps["supported_codecs"] = serde_json::json!(codecs);
        caps["encoders"] = serde_json::json!(encoders);
    }

    debug!("Worker capabilities: {caps}");
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nvidia_caps(encoders: &[(&str, VideoCodec)]) -> GpuCapabilities {
        let mut map: BTreeMap<VideoCodec, Vec<EncoderInfo>> = BTreeMap::new();
        for (name, codec) in encoders {
            map.entry(*codec).or_default().push(EncoderInfo {
                name: name.to_string(),
                codec: *codec,
                hwaccel_type: HwAccelType::Nvidia,
                is_hardware: true,
            });
        }
        GpuCapabilities {
            hwaccel_type: HwAccelType::Nvidia,
            device_name: "NVIDIA GeForce RTX 3070".to_string(),
            device_path: None,
            encoders: map,
            max_concurrent_sessions: 3,
            driver_version: Some("550.54".to_string()),
        }
    }

    #[test]
    fn test_session_limits_by_model() {
        assert_eq!(nvidia_session_limit("NVIDIA GeForce RTX 4090"), 5);
        assert_eq!(nvidia_session_limit("NVIDIA GeForce RTX 3060"), 3);
        assert_eq!(nvidia_session_limit("Tesla T4"), 999);
        assert_eq!(nvidia_session_limit("Mystery GPU 9000"), 3);
    }

    #[test]
    fn test_select_preferred_hardware_encoder() {
        let caps = nvidia_caps(&[
            ("h264_nvenc", VideoCodec::H264),
            ("hevc_nvenc", VideoCodec::Hevc),
        ]);
        let selection = select_encoder(Some(&caps), VideoCodec::Hevc, 1080);
        assert_eq!(selection.encoder.name, "hevc_nvenc");
        assert!(selection.encoder.is_hardware);
        assert!(selection.input_args.contains(&"cuda".to_string()));
        // Apple compatibility tag rides along with HEVC
        assert!(selection.output_args.contains(&"hvc1".to_string()));
    }

    #[test]
    fn test_falls_back_to_h264_on_same_gpu() {
        let caps = nvidia_caps(&[("h264_nvenc", VideoCodec::H264)]);
        let selection = select_encoder(Some(&caps), VideoCodec::Av1, 720);
        assert_eq!(selection.encoder.name, "h264_nvenc");
        assert!(selection.encoder.is_hardware);
    }

    #[test]
    fn test_falls_back_to_software_without_gpu() {
        let selection = select_encoder(None, VideoCodec::H264, 1080);
        assert_eq!(selection.encoder.name, "libx264");
        assert!(!selection.encoder.is_hardware);
        assert!(selection.input_args.is_empty());
        assert_eq!(selection.scale_filter, "scale=-2:1080");

        let hevc = select_encoder(None, VideoCodec::Hevc, 1080);
        assert_eq!(hevc.encoder.name, "libx265");
        assert!(hevc.output_args.contains(&"hvc1".to_string()));

        let av1 = select_encoder(None, VideoCodec::Av1, 1080);
        assert_eq!(av1.encoder.name, "libsvtav1");
    }

    #[test]
    fn test_vaapi_selection_uses_device_and_gpu_scaler() {
        let mut map: BTreeMap<VideoCodec, Vec<EncoderInfo>> = BTreeMap::new();
        map.entry(VideoCodec::H264).or_default().push(EncoderInfo {
            name: "h264_vaapi".to_string(),
            codec: VideoCodec::H264,
            hwaccel_type: HwAccelType::Intel,
            is_hardware: true,
        });
        let caps = GpuCapabilities {
            hwaccel_type: HwAccelType::Intel,
            device_name: "Intel Arc GPU".to_string(),
            device_path: Some("/dev/dri/renderD129".to_string()),
            encoders: map,
            max_concurrent_sessions: 10,
            driver_version: None,
        };

        let selection = select_encoder(Some(&caps), VideoCodec::H264, 480);
        assert_eq!(selection.encoder.name, "h264_vaapi");
        assert!(selection
            .input_args
            .contains(&"/dev/dri/renderD129".to_string()));
        assert!(selection.scale_filter.contains("scale_vaapi=-2:480"));
    }

    #[test]
    fn test_parallel_sessions_reserve_headroom() {
        let caps = nvidia_caps(&[("h264_nvenc", VideoCodec::H264)]);
        assert_eq!(recommended_parallel_qualities(Some(&caps), 0), 2);
        assert_eq!(recommended_parallel_qualities(None, 0), 1);
        // Fixed configuration wins over detection
        assert_eq!(recommended_parallel_qualities(Some(&caps), 5), 5);
    }

    #[test]
    fn test_codec_parsing() {
        assert_eq!(VideoCodec::parse("hevc"), VideoCodec::Hevc);
        assert_eq!(VideoCodec::parse("h265"), VideoCodec::Hevc);
        assert_eq!(VideoCodec::parse("av1"), VideoCodec::Av1);
        assert_eq!(VideoCodec::parse("anything"), VideoCodec::H264);
    }

    #[tokio::test]
    async fn test_worker_capabilities_without_gpu() {
        let caps = worker_capabilities(None).await;
        assert_eq!(caps["hwaccel_enabled"], false);
        assert_eq!(caps["hwaccel_type"], "none");
        assert_eq!(caps["max_concurrent_encode_sessions"], 1);
    }
}
