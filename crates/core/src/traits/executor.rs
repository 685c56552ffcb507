use async_trait::async_trait;

use crate::models::{JobMessage, Outcome};

/// 约简执行器; 所有失败都归结为 `Outcome::Error`
#[async_trait]
pub trait ReductionExecutor: Send + Sync {
    async fn execute(&self, job: &JobMessage) -> Outcome;
}
