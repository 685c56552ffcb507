use serde::{Deserialize, Serialize};

use super::{ExperimentId, JobMessage, LogLocations, RunRecord, RunStatus};

/// 发布到 started/complete/error 队列的状态消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: RunStatus,
    pub run_number: u64,
    pub run_version: u32,
    pub experiment_id: ExperimentId,
    pub instrument: String,
    pub facility: String,
    pub message: Option<String>,
    pub reduction_data: Option<String>,
    pub log_locations: Option<LogLocations>,
}

impl StatusMessage {
    pub fn for_job(job: &JobMessage, status: RunStatus) -> Self {
        Self {
            status,
            run_number: job.run_number,
            run_version: job.run_version,
            experiment_id: job.experiment_id.clone(),
            instrument: job.instrument.clone(),
            facility: job.facility.clone(),
            message: None,
            reduction_data: None,
            log_locations: None,
        }
    }

    /// 由记录的当前状态重建, 重复投递时重新发布
    pub fn from_record(record: &RunRecord) -> Self {
        Self {
            status: record.status,
            run_number: record.identity.run_number,
            run_version: record.identity.run_version,
            experiment_id: record.experiment_id.clone(),
            instrument: record.instrument.clone(),
            facility: record.job.facility.clone(),
            message: record.message.clone(),
            reduction_data: record.output_directory.clone(),
            log_locations: record.log_locations.clone(),
        }
    }

    pub fn to_vec(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
