//! 可续传 HTTP 下载引擎
//!
//! 给定源地址与续传目标（已有临时文件、其当前长度、上次的校验值），
//! 发起 GET 请求并把响应主体流式写入临时文件。
//!
//! 协议要点：
//! - 有半成品时带 `Range: bytes=<offset>-` 与 `If-Range: <校验值>` 请求
//! - Range 请求收到 200（服务器无视了区间）：丢弃半成品从零重下，
//!   每次尝试至多重启一次，防止只会回 200 的服务器造成死循环
//! - 续传请求收到 416：区间越界说明文件已完整，按成功收尾
//! - 总大小解析优先级：Content-Range 斜杠后缀 > 206 时已有字节+Content-Length
//!   > 裸 Content-Length > 未知(0)
//! - 每个响应的 ETag / Last-Modified 都回写进状态，供下次 If-Range 使用

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::progress::{ProgressGate, ProgressUpdate, SpeedCalculator};
use crate::config::DownloadConfig;
use crate::task::TransferState;

/// 传输失败分类（单次尝试的硬失败）
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// 2xx/206/416 之外、且无法内部消化的响应
    #[error("HTTP 状态异常: {0}")]
    Status(StatusCode),
    /// 服务器反复对 Range 请求回 200
    #[error("服务器不支持断点续传")]
    ResumeUnsupported,
    /// 响应主体提前结束
    #[error("响应主体被截断: {downloaded}/{total}")]
    Truncated { downloaded: u64, total: u64 },
    /// 连接/读取失败
    #[error("网络请求失败: {0}")]
    Request(#[from] reqwest::Error),
    /// 临时文件读写失败
    #[error("临时文件读写失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 单次传输的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// 下载完成
    Completed,
    /// 协作式取消（暂停与取消都走此路径，临时文件保留，由发起方处置）
    Cancelled,
}

/// 下载引擎：包装共享的 HTTP 客户端与下载配置
pub struct TransferEngine {
    client: Client,
    config: DownloadConfig,
}

impl TransferEngine {
    pub fn new(config: DownloadConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("构建 HTTP 客户端失败")?;
        Ok(Self { client, config })
    }

    /// 把 `state.url` 的内容续传写入 `temp_path`。
    ///
    /// 续传起点以磁盘上的文件长度为准，快照里的字节数只是展示值。
    /// 进度经 `on_progress` 限频上报；取消令牌在每个数据块之间检查
    pub async fn download<F>(
        &self,
        temp_path: &Path,
        state: &mut TransferState,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<TransferOutcome, TransferError>
    where
        F: FnMut(ProgressUpdate),
    {
        let interval = Duration::from_millis(self.config.progress_interval_ms);
        let mut offset = match tokio::fs::metadata(temp_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let mut restarted = false;

        loop {
            let ranged = offset > 0;
            let mut request = self.client.get(&state.url);
            if let Some(referer) = &self.config.referer {
                request = request.header(header::REFERER, referer);
            }
            if ranged {
                request = request.header(header::RANGE, format!("bytes={}-", offset));
                if let Some(validator) = state.etag.as_deref().or(state.last_modified.as_deref())
                {
                    request = request.header(header::IF_RANGE, validator);
                }
            }

            let response = request.send().await?;
            let status = response.status();

            if ranged && status == StatusCode::RANGE_NOT_SATISFIABLE {
                // 请求区间越过文件末尾：半成品其实已经是完整文件
                state.downloaded = offset;
                if state.total == 0 {
                    state.total = offset;
                }
                state.speed = 0;
                info!("任务 {} 续传收到 416，视为已下载完成", state.task_id);
                return Ok(TransferOutcome::Completed);
            }

            if ranged && status == StatusCode::OK {
                // 服务器无视 Range：半成品与响应主体无法拼接，清零重来
                if restarted {
                    warn!("任务 {} 的服务器反复返回 200，放弃续传", state.task_id);
                    return Err(TransferError::ResumeUnsupported);
                }
                restarted = true;
                info!(
                    "任务 {} 的服务器不支持 Range，丢弃 {} 字节半成品后重下",
                    state.task_id, offset
                );
                tokio::fs::remove_file(temp_path).await.ok();
                offset = 0;
                state.downloaded = 0;
                continue;
            }

            if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
                return Err(TransferError::Status(status));
            }

            // 捕获本次响应的校验值，续传安全性依赖于此
            state.etag = header_string(&response, header::ETAG);
            state.last_modified = header_string(&response, header::LAST_MODIFIED);

            let total = resolve_total(status, offset, &response);
            if total > 0 {
                state.total = total;
            }

            // 206 在已有字节后追加；200 截断重建
            let mut file = if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(temp_path)
                    .await?
            } else {
                offset = 0;
                File::create(temp_path).await?
            };

            debug!(
                "任务 {} 开始传输: offset={}, total={}, status={}",
                state.task_id, offset, state.total, status
            );

            let mut downloaded = offset;
            let mut speed = SpeedCalculator::new(interval);
            let mut gate = ProgressGate::new(interval);
            let mut stream = response.bytes_stream();

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        file.flush().await?;
                        state.downloaded = downloaded;
                        state.speed = 0;
                        debug!("任务 {} 在 {} 字节处取消", state.task_id, downloaded);
                        return Ok(TransferOutcome::Cancelled);
                    }
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = next else { break };
                let bytes = chunk?;
                file.write_all(&bytes).await?;
                downloaded += bytes.len() as u64;
                speed.record(bytes.len() as u64);

                if gate.ready() {
                    state.downloaded = downloaded;
                    state.speed = speed.speed();
                    on_progress(ProgressUpdate {
                        downloaded,
                        total: state.total,
                        speed: state.speed,
                        eta_secs: speed.eta(downloaded, state.total),
                    });
                }
            }

            file.flush().await?;
            state.downloaded = downloaded;
            state.speed = 0;

            if state.total > 0 && downloaded < state.total {
                return Err(TransferError::Truncated {
                    downloaded,
                    total: state.total,
                });
            }
            if state.total == 0 {
                state.total = downloaded;
            }

            // 收尾上报一次，终值必须可见
            on_progress(ProgressUpdate {
                downloaded,
                total: state.total,
                speed: 0,
                eta_secs: None,
            });
            info!("任务 {} 传输完成: {} 字节", state.task_id, downloaded);
            return Ok(TransferOutcome::Completed);
        }
    }
}

/// 按优先级解析总大小
fn resolve_total(status: StatusCode, offset: u64, response: &reqwest::Response) -> u64 {
    if let Some(value) = response
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(total) = parse_content_range_total(value) {
            return total;
        }
    }
    let length = response.content_length().unwrap_or(0);
    if length == 0 {
        return 0;
    }
    if status == StatusCode::PARTIAL_CONTENT {
        offset + length
    } else {
        length
    }
}

/// 解析 `Content-Range: bytes 400-999/1000` 的总大小部分；`*` 表示未知
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse::<u64>().ok()
}

fn header_string(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
