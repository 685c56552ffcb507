use crate::config::PathsConfig;

/// 将归档 UNC 路径转换为本机挂载路径
///
/// 规则按顺序匹配, 第一个命中的生效:
/// 1. 仪器共享前缀 (`\\isis\inst$\`) 替换为归档挂载点
/// 2. 临时归档前缀 (`\\autoreduce\data\`) 替换为 `{temp_root}/data/`
/// 3. 其余反斜杠全部换成正斜杠
///
/// 纯函数, 不做任何 I/O, 对 POSIX 路径幂等。
#[derive(Debug, Clone)]
pub struct PathTranslator {
    archive_unc_prefix: String,
    archive_mount: String,
    temp_unc_prefix: String,
    temp_data_root: String,
}

impl PathTranslator {
    pub fn new(
        archive_unc_prefix: impl Into<String>,
        archive_mount: impl Into<String>,
        temp_unc_prefix: impl Into<String>,
        temp_root: &str,
    ) -> Self {
        Self {
            archive_unc_prefix: archive_unc_prefix.into(),
            archive_mount: archive_mount.into(),
            temp_unc_prefix: temp_unc_prefix.into(),
            temp_data_root: format!("{}/data/", temp_root.trim_end_matches('/')),
        }
    }

    pub fn from_config(config: &PathsConfig) -> Self {
        Self::new(
            config.archive_unc_prefix.clone(),
            config.archive_mount.clone(),
            config.temp_unc_prefix.clone(),
            &config.temp_root,
        )
    }

    pub fn translate(&self, path: &str) -> String {
        let rewritten = if let Some(rest) = strip_prefix_ignore_case(path, &self.archive_unc_prefix)
        {
            format!("{}{}", self.archive_mount, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(path, &self.temp_unc_prefix) {
            format!("{}{}", self.temp_data_root, rest)
        } else {
            path.to_string()
        };
        rewritten.replace('\\', "/")
    }
}

impl Default for PathTranslator {
    fn default() -> Self {
        Self::from_config(&PathsConfig::default())
    }
}

// UNC 路径不区分大小写
fn strip_prefix_ignore_case<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() || path.len() < prefix.len() || !path.is_char_boundary(prefix.len()) {
        return None;
    }
    let (head, rest) = path.split_at(prefix.len());
    head.eq_ignore_ascii_case(prefix).then_some(rest)
}
