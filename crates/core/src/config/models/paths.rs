use serde::{Deserialize, Serialize};

/// Archive path conventions and output layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub archive_unc_prefix: String,
    pub archive_mount: String,
    pub temp_unc_prefix: String,
    pub temp_root: String,
    /// 输出目录根, 例如 `/instrument`
    pub output_root: String,
    /// 直接写入 autoreduced 目录、不按运行号分目录的仪器
    pub flat_output_instruments: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            archive_unc_prefix: r"\\isis\inst$\".to_string(),
            archive_mount: "/isis/".to_string(),
            temp_unc_prefix: r"\\autoreduce\data\".to_string(),
            temp_root: "/autoreduce".to_string(),
            output_root: "/instrument".to_string(),
            flat_output_instruments: ["LET", "MARI", "MAPS", "MERLIN", "WISH", "GEM"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PathsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.archive_unc_prefix.starts_with(r"\\") || !self.temp_unc_prefix.starts_with(r"\\")
        {
            return Err(anyhow::anyhow!("UNC前缀必须以双反斜杠开头"));
        }

        for (name, path) in [
            ("archive_mount", &self.archive_mount),
            ("temp_root", &self.temp_root),
            ("output_root", &self.output_root),
        ] {
            if !path.starts_with('/') {
                return Err(anyhow::anyhow!("{name} 必须是绝对路径: {path}"));
            }
            if path.contains('\\') {
                return Err(anyhow::anyhow!("{name} 不能包含反斜杠: {path}"));
            }
        }

        Ok(())
    }

    pub fn is_flat_output(&self, instrument: &str) -> bool {
        self.flat_output_instruments
            .iter()
            .any(|i| i.eq_ignore_ascii_case(instrument))
    }
}
