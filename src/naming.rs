//! 文件与目标文件夹命名辅助
//!
//! 纯函数：输入 (标题, 外部引用, 既有名字集合)，输出稳定、合法、不冲突的名称。
//! 除调用方传入的既有名字集合外没有任何隐藏状态。

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// 名称最大长度（按字符计，兼顾常见文件系统的字节上限）
const MAX_NAME_CHARS: usize = 80;

/// Windows/Unix 均不允许出现在文件名里的字符，外加控制字符
fn invalid_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[\\/:*?"<>|\x00-\x1f]"#).expect("invalid filename regex"))
}

/// 清洗文件名：替换非法字符、折叠空白、去掉首尾的点和空格、截断。
/// 清洗后为空的名称回退为「未命名」
pub fn sanitize_file_name(name: &str) -> String {
    let replaced = invalid_chars().replace_all(name, " ");
    let collapsed: String = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c| c == '.' || c == ' ');

    let truncated: String = trimmed.chars().take(MAX_NAME_CHARS).collect();
    let truncated = truncated.trim_matches(|c| c == '.' || c == ' ').to_string();

    if truncated.is_empty() {
        "未命名".to_string()
    } else {
        truncated
    }
}

/// 从标题与外部引用推导目标文件夹名，并对既有名字集合去重。
///
/// 外部引用拼在标题后面保证同名标题的不同稿件得到不同文件夹；
/// 仍然冲突时追加递增序号
pub fn resolve_folder_name(
    title: &str,
    external_ref: Option<&str>,
    existing: &HashSet<String>,
) -> String {
    let base = sanitize_file_name(title);
    let base = match external_ref {
        Some(ext) if !ext.trim().is_empty() => {
            format!("{}-{}", base, sanitize_file_name(ext))
        }
        _ => base,
    };
    // 拼接后整体再截断一次，长标题加引用不会超出上限
    let base: String = base.chars().take(MAX_NAME_CHARS).collect();

    if !existing.contains(&base) {
        return base;
    }

    let mut serial = 2u32;
    loop {
        let candidate = format!("{}({})", base, serial);
        if !existing.contains(&candidate) {
            return candidate;
        }
        serial += 1;
    }
}
