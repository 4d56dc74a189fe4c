//! 测试专用的本地 HTTP 服务器
//!
//! 手写的最小实现，精确控制 200/206/416、截断与慢速流，
//! 用于验证续传协议的各个分支。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// 服务器收到的一次请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    /// 解析 `Range: bytes=<start>-` 的起始偏移
    pub fn range_start(&self) -> Option<u64> {
        let value = self.header("range")?;
        let rest = value.strip_prefix("bytes=")?;
        rest.split('-').next()?.parse().ok()
    }
}

/// 路由：
/// - /ok            正常支持 Range 的 1000 字节文件
/// - /norange       无视 Range，始终 200 全量
/// - /flaky         第一次请求在 400 字节处掐断连接，之后表现同 /ok
/// - /slow          支持 Range，按 100 字节/25ms 慢速输出
/// - /nolen         200、无 Content-Length，靠连接关闭定界
/// - /missing       404
/// - /file/<name>   从配置目录按名字提供文件（支持 Range）
pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<parking_lot::Mutex<Vec<RecordedRequest>>>,
}

/// 固定参照内容：1000 字节的确定性序列
pub fn body_bytes() -> Vec<u8> {
    (0..1000u32).map(|i| (i % 251) as u8).collect()
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_dir(None).await
    }

    /// 额外挂载一个文件目录到 /file/<name>
    pub async fn start_with_dir(serve_dir: Option<PathBuf>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let flaky_hits = Arc::new(AtomicUsize::new(0));

        let requests_bg = requests.clone();
        let flaky_bg = flaky_hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let requests = requests_bg.clone();
                let flaky = flaky_bg.clone();
                let dir = serve_dir.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, requests, flaky, dir).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests_for(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    requests: Arc<parking_lot::Mutex<Vec<RecordedRequest>>>,
    flaky_hits: Arc<AtomicUsize>,
    serve_dir: Option<PathBuf>,
) -> std::io::Result<()> {
    // 读取请求头（GET 无主体）
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Ok(());
        }
        buf.push(byte[0]);
    }
    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or_default();
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let request = RecordedRequest {
        path: path.clone(),
        headers,
    };
    requests.lock().push(request.clone());

    let body = body_bytes();
    match path.as_str() {
        "/norange" => {
            write_response(
                &mut stream,
                200,
                &[("Content-Length", &body.len().to_string())],
            )
            .await?;
            stream.write_all(&body).await?;
        }
        "/nolen" => {
            write_response(&mut stream, 200, &[]).await?;
            stream.write_all(&body).await?;
        }
        "/missing" => {
            write_response(&mut stream, 404, &[("Content-Length", "0")]).await?;
        }
        "/flaky" if flaky_hits.fetch_add(1, Ordering::SeqCst) == 0 => {
            // 第一次请求：声称 1000 字节但只给 400 就断开
            write_response(&mut stream, 200, &[("Content-Length", "1000")]).await?;
            stream.write_all(&body[..400]).await?;
            stream.flush().await?;
        }
        "/slow" => {
            let start = request.range_start().unwrap_or(0) as usize;
            serve_range(&mut stream, &body, start, true).await?;
        }
        p if p.starts_with("/file/") => {
            let name = p.trim_start_matches("/file/");
            let content = match serve_dir.as_ref() {
                Some(dir) => tokio::fs::read(dir.join(name)).await.ok(),
                None => None,
            };
            match content {
                Some(content) => {
                    let start = request.range_start().unwrap_or(0) as usize;
                    if start >= content.len() {
                        write_response(
                            &mut stream,
                            416,
                            &[("Content-Range", &format!("bytes */{}", content.len()))],
                        )
                        .await?;
                    } else {
                        serve_range(&mut stream, &content, start, false).await?;
                    }
                }
                None => {
                    write_response(&mut stream, 404, &[("Content-Length", "0")]).await?;
                }
            }
        }
        _ => {
            // /ok 与第二次之后的 /flaky
            let start = request.range_start().unwrap_or(0) as usize;
            if start >= body.len() {
                write_response(
                    &mut stream,
                    416,
                    &[("Content-Range", &format!("bytes */{}", body.len()))],
                )
                .await?;
            } else {
                serve_range(&mut stream, &body, start, false).await?;
            }
        }
    }
    stream.shutdown().await.ok();
    Ok(())
}

async fn serve_range(
    stream: &mut TcpStream,
    body: &[u8],
    start: usize,
    slow: bool,
) -> std::io::Result<()> {
    let remainder = &body[start..];
    if start > 0 {
        write_response(
            stream,
            206,
            &[
                ("Content-Length", &remainder.len().to_string()),
                (
                    "Content-Range",
                    &format!("bytes {}-{}/{}", start, body.len() - 1, body.len()),
                ),
            ],
        )
        .await?;
    } else {
        write_response(stream, 200, &[("Content-Length", &body.len().to_string())]).await?;
    }
    if slow {
        for chunk in remainder.chunks(100) {
            stream.write_all(chunk).await?;
            stream.flush().await?;
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    } else {
        stream.write_all(remainder).await?;
    }
    Ok(())
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    extra_headers: &[(&str, &str)],
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        206 => "Partial Content",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        _ => "Unknown",
    };
    let mut response = format!("HTTP/1.1 {} {}\r\n", status, reason);
    response.push_str("ETag: \"v1\"\r\n");
    response.push_str("Last-Modified: Wed, 21 Oct 2015 07:28:00 GMT\r\n");
    response.push_str("Connection: close\r\n");
    for (name, value) in extra_headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await
}

// ==================== MP4 测试素材 ====================

use mp4::{
    AacConfig, AudioObjectType, AvcConfig, ChannelConfig, MediaConfig, Mp4Config, Mp4Sample,
    Mp4Writer, SampleFreqIndex, TrackConfig, TrackType,
};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

fn test_mp4_config() -> Mp4Config {
    Mp4Config {
        major_brand: str::parse("isom").unwrap(),
        minor_version: 512,
        compatible_brands: vec![
            str::parse("isom").unwrap(),
            str::parse("iso2").unwrap(),
            str::parse("avc1").unwrap(),
            str::parse("mp41").unwrap(),
        ],
        timescale: 1000,
    }
}

/// 写一个单视频轨（H.264）的测试容器，sample_count 个 40 tick 的样本
pub fn write_video_source(path: &Path, sample_count: u32) {
    let file = BufWriter::new(File::create(path).unwrap());
    let mut writer = Mp4Writer::write_start(file, &test_mp4_config()).unwrap();
    writer
        .add_track(&TrackConfig {
            track_type: TrackType::Video,
            timescale: 1000,
            language: "und".to_string(),
            media_conf: MediaConfig::AvcConfig(AvcConfig {
                width: 1280,
                height: 720,
                seq_param_set: vec![0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 0x40],
                pic_param_set: vec![0x68, 0xeb, 0xe3, 0xcb],
            }),
        })
        .unwrap();
    for i in 0..sample_count {
        writer
            .write_sample(
                1,
                &Mp4Sample {
                    start_time: (i as u64) * 40,
                    duration: 40,
                    rendering_offset: 0,
                    is_sync: i % 30 == 0,
                    bytes: bytes::Bytes::from(vec![0x11u8; 32]),
                },
            )
            .unwrap();
    }
    writer.write_end().unwrap();
}

/// 写一个单音频轨（AAC）的测试容器
pub fn write_audio_source(path: &Path, sample_count: u32) {
    let file = BufWriter::new(File::create(path).unwrap());
    let mut writer = Mp4Writer::write_start(file, &test_mp4_config()).unwrap();
    writer
        .add_track(&TrackConfig {
            track_type: TrackType::Audio,
            timescale: 48000,
            language: "und".to_string(),
            media_conf: MediaConfig::AacConfig(AacConfig {
                bitrate: 128_000,
                profile: AudioObjectType::AacLowComplexity,
                freq_index: SampleFreqIndex::Freq48000,
                chan_conf: ChannelConfig::Stereo,
            }),
        })
        .unwrap();
    for i in 0..sample_count {
        writer
            .write_sample(
                1,
                &Mp4Sample {
                    start_time: (i as u64) * 1024,
                    duration: 1024,
                    rendering_offset: 0,
                    is_sync: true,
                    bytes: bytes::Bytes::from(vec![0x22u8; 16]),
                },
            )
            .unwrap();
    }
    writer.write_end().unwrap();
}
