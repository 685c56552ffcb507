use serde::{Deserialize, Serialize};

/// Record store backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordStoreType {
    #[default]
    Memory,
    Postgres,
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordStoreConfig {
    #[serde(rename = "type")]
    pub r#type: RecordStoreType,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            r#type: RecordStoreType::Memory,
            url: "postgresql://localhost/autoreduce".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
        }
    }
}

impl RecordStoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.r#type == RecordStoreType::Postgres {
            if self.url.is_empty() {
                return Err(anyhow::anyhow!("数据库URL不能为空"));
            }
            if !self.url.starts_with("postgres://") && !self.url.starts_with("postgresql://") {
                return Err(anyhow::anyhow!("数据库URL必须是PostgreSQL格式"));
            }
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }

        if self.min_connections > self.max_connections {
            return Err(anyhow::anyhow!("最小连接数不能大于最大连接数"));
        }

        Ok(())
    }
}
