//! 合流单元
//!
//! 把两个下载完成的基本流文件（一个含视频轨、一个含音频轨）复用进
//! 同一个容器。只做样本级拷贝，不转码：每条选中的轨道按源顺序逐样本
//! 写入目标轨，显式携带大小、时间戳与同步标记。
//!
//! 失败语义：目标文件写了一半就删掉，两个源文件原样保留，
//! 编排器可以只重试合流阶段而不重新下载。

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use mp4::{
    AacConfig, AvcConfig, HevcConfig, MediaConfig, MediaType, Mp4Config, Mp4Reader, Mp4Track,
    Mp4Writer, TrackConfig, TrackType, TtxtConfig, Vp9Config,
};
use tracing::{info, warn};

/// 合流错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// 两个来源都缺失或不可读
    NoSource,
    /// 任何来源中都没有符合类型的轨道
    NoTrack,
    /// 容器读写失败
    Container(String),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::NoSource => write!(f, "源文件缺失或不可读"),
            MergeError::NoTrack => write!(f, "源文件中没有可用的音视频轨道"),
            MergeError::Container(msg) => write!(f, "容器读写失败: {}", msg),
        }
    }
}

impl std::error::Error for MergeError {}

fn container<E: std::fmt::Display>(err: E) -> MergeError {
    MergeError::Container(err.to_string())
}

/// 合流结果统计
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeReport {
    /// 复制的视频样本数
    pub video_samples: u32,
    /// 复制的音频样本数
    pub audio_samples: u32,
}

/// 把 `video_src` 的视频轨与 `audio_src` 的音频轨复用进 `dest`。
///
/// 一侧缺少对应轨道时容忍（输出单轨）；两侧都选不出轨道则失败。
/// 容器操作是纯阻塞 I/O，放到阻塞线程池里跑
pub async fn merge_streams(
    video_src: PathBuf,
    audio_src: PathBuf,
    dest: PathBuf,
) -> Result<MergeReport, MergeError> {
    let dest_cleanup = dest.clone();
    let result =
        tokio::task::spawn_blocking(move || merge_blocking(&video_src, &audio_src, &dest)).await;

    match result {
        Ok(Ok(report)) => Ok(report),
        Ok(Err(err)) => {
            // 半成品目标不可信，删掉；源文件保留给重试
            std::fs::remove_file(&dest_cleanup).ok();
            Err(err)
        }
        Err(join_err) => {
            std::fs::remove_file(&dest_cleanup).ok();
            Err(MergeError::Container(join_err.to_string()))
        }
    }
}

fn merge_blocking(video_src: &Path, audio_src: &Path, dest: &Path) -> Result<MergeReport, MergeError> {
    let mut video_reader = open_reader(video_src);
    let mut audio_reader = open_reader(audio_src);
    if video_reader.is_none() && audio_reader.is_none() {
        return Err(MergeError::NoSource);
    }

    let out = BufWriter::new(File::create(dest).map_err(container)?);
    let mut writer = Mp4Writer::write_start(out, &output_config()).map_err(container)?;

    let mut report = MergeReport::default();
    // 目标轨道 ID 由写入端按加入顺序从 1 递增分配
    let mut next_dest_track = 1u32;

    if let Some(reader) = video_reader.as_mut() {
        match select_track(reader, TrackType::Video) {
            Some(track_id) => {
                report.video_samples = copy_track(reader, track_id, &mut writer, next_dest_track)?;
                next_dest_track += 1;
            }
            None => warn!("视频来源 {:?} 中没有视频轨道", video_src),
        }
    }
    if let Some(reader) = audio_reader.as_mut() {
        match select_track(reader, TrackType::Audio) {
            Some(track_id) => {
                report.audio_samples = copy_track(reader, track_id, &mut writer, next_dest_track)?;
            }
            None => warn!("音频来源 {:?} 中没有音频轨道", audio_src),
        }
    }

    if report.video_samples == 0 && report.audio_samples == 0 {
        return Err(MergeError::NoTrack);
    }

    writer.write_end().map_err(container)?;
    info!(
        "合流完成: {:?} (视频 {} 样本, 音频 {} 样本)",
        dest, report.video_samples, report.audio_samples
    );
    Ok(report)
}

/// 打开一个来源作为解复用上下文；缺失或损坏按 None 处理
fn open_reader(path: &Path) -> Option<Mp4Reader<BufReader<File>>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(err) => {
            warn!("打开合流来源失败 {:?}: {}", path, err);
            return None;
        }
    };
    let size = file.metadata().ok()?.len();
    match Mp4Reader::read_header(BufReader::new(file), size) {
        Ok(reader) => Some(reader),
        Err(err) => {
            warn!("解析容器头失败 {:?}: {}", path, err);
            None
        }
    }
}

/// 选择第一条声明类型匹配的轨道（按轨道 ID 升序）
fn select_track<R: Read + Seek>(reader: &Mp4Reader<R>, wanted: TrackType) -> Option<u32> {
    let mut ids: Vec<u32> = reader.tracks().keys().copied().collect();
    ids.sort_unstable();
    ids.into_iter().find(|id| {
        reader
            .tracks()
            .get(id)
            .and_then(|t| t.track_type().ok())
            .map(|tt| tt == wanted)
            .unwrap_or(false)
    })
}

/// 从源轨道派生目标轨道配置（编码参数、时间基、语言原样保留）
fn track_config(track: &Mp4Track) -> Result<TrackConfig, MergeError> {
    let media_conf = match track.media_type().map_err(container)? {
        MediaType::H264 => MediaConfig::AvcConfig(AvcConfig {
            width: track.width(),
            height: track.height(),
            seq_param_set: track.sequence_parameter_set().map_err(container)?.to_vec(),
            pic_param_set: track.picture_parameter_set().map_err(container)?.to_vec(),
        }),
        MediaType::H265 => MediaConfig::HevcConfig(HevcConfig {
            width: track.width(),
            height: track.height(),
        }),
        MediaType::VP9 => MediaConfig::Vp9Config(Vp9Config {
            width: track.width(),
            height: track.height(),
        }),
        MediaType::AAC => MediaConfig::AacConfig(AacConfig {
            bitrate: track.bitrate(),
            profile: track.audio_profile().map_err(container)?,
            freq_index: track.sample_freq_index().map_err(container)?,
            chan_conf: track.channel_config().map_err(container)?,
        }),
        MediaType::TTXT => MediaConfig::TtxtConfig(TtxtConfig {}),
        other => {
            return Err(MergeError::Container(format!(
                "不支持的编码类型: {:?}",
                other
            )))
        }
    };
    Ok(TrackConfig {
        track_type: track.track_type().map_err(container)?,
        timescale: track.timescale(),
        language: track.language().to_string(),
        media_conf,
    })
}

/// 把一条源轨道的全部样本按源顺序拷贝进目标轨道
fn copy_track<R, W>(
    reader: &mut Mp4Reader<R>,
    src_track_id: u32,
    writer: &mut Mp4Writer<W>,
    dest_track_id: u32,
) -> Result<u32, MergeError>
where
    R: Read + Seek,
    W: Write + Seek,
{
    let (config, sample_count) = {
        let track = reader
            .tracks()
            .get(&src_track_id)
            .ok_or_else(|| MergeError::Container(format!("轨道 {} 丢失", src_track_id)))?;
        (track_config(track)?, track.sample_count())
    };
    writer.add_track(&config).map_err(container)?;

    let mut copied = 0u32;
    for index in 0..sample_count {
        let sample_id = index + 1;
        let sample = reader
            .read_sample(src_track_id, sample_id)
            .map_err(container)?
            .ok_or_else(|| MergeError::Container(format!("样本 {} 缺失", sample_id)))?;
        writer.write_sample(dest_track_id, &sample).map_err(container)?;
        copied += 1;
    }
    Ok(copied)
}

fn output_config() -> Mp4Config {
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
