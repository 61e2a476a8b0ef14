use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of a placeholder reference: `@/<folderPath>/<filename>` names the record
/// that will be materialized from that draft file once it has been created remotely.
pub const PSEUDO_REF_PREFIX: &str = "@/";

/// Prefix of locally generated record ids that must never reach a connector.
pub const TEMP_ID_PREFIX: &str = "scratch_temp_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    Main,
    Dirty,
}

impl Branch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Dirty => "dirty",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "main" => Some(Self::Main),
            "dirty" => Some(Self::Dirty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Edit,
    Create,
    Delete,
    Backfill,
}

impl Phase {
    /// Fixed execution order. Backfill runs last because it needs ids minted by create.
    pub const ORDERED: [Phase; 4] = [Phase::Edit, Phase::Create, Phase::Delete, Phase::Backfill];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Backfill => "backfill",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "edit" => Some(Self::Edit),
            "create" => Some(Self::Create),
            "delete" => Some(Self::Delete),
            "backfill" => Some(Self::Backfill),
            _ => None,
        }
    }

    pub fn operation_kind(&self) -> OperationKind {
        match self {
            Self::Edit | Self::Backfill => OperationKind::Update,
            Self::Create => OperationKind::Create,
            Self::Delete => OperationKind::Delete,
        }
    }

    pub fn running_status(&self) -> PlanStatus {
        match self {
            Self::Edit => PlanStatus::EditsRunning,
            Self::Create => PlanStatus::CreatesRunning,
            Self::Delete => PlanStatus::DeletesRunning,
            Self::Backfill => PlanStatus::BackfillsRunning,
        }
    }

    pub fn completed_status(&self) -> PlanStatus {
        match self {
            Self::Edit => PlanStatus::EditsCompleted,
            Self::Create => PlanStatus::CreatesCompleted,
            Self::Delete => PlanStatus::DeletesCompleted,
            Self::Backfill => PlanStatus::BackfillsCompleted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanStatus {
    Planning,
    Planned,
    EditsRunning,
    EditsCompleted,
    CreatesRunning,
    CreatesCompleted,
    DeletesRunning,
    DeletesCompleted,
    BackfillsRunning,
    BackfillsCompleted,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::EditsRunning => "edits-running",
            Self::EditsCompleted => "edits-completed",
            Self::CreatesRunning => "creates-running",
            Self::CreatesCompleted => "creates-completed",
            Self::DeletesRunning => "deletes-running",
            Self::DeletesCompleted => "deletes-completed",
            Self::BackfillsRunning => "backfills-running",
            Self::BackfillsCompleted => "backfills-completed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let status = match value {
            "planning" => Self::Planning,
            "planned" => Self::Planned,
            "edits-running" => Self::EditsRunning,
            "edits-completed" => Self::EditsCompleted,
            "creates-running" => Self::CreatesRunning,
            "creates-completed" => Self::CreatesCompleted,
            "deletes-running" => Self::DeletesRunning,
            "deletes-completed" => Self::DeletesCompleted,
            "backfills-running" => Self::BackfillsRunning,
            "backfills-completed" => Self::BackfillsCompleted,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => return None,
        };
        Some(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryStatus {
    Pending,
    Success,
    FailedBatch,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::FailedBatch => "failed-batch",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed-batch" => Some(Self::FailedBatch),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSummary {
    #[serde(rename = "type")]
    pub phase: Phase,
    pub record_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPlan {
    pub id: String,
    pub workbook_id: String,
    pub user_id: String,
    pub connector_account_id: Option<String>,
    pub branch_name: String,
    pub status: PlanStatus,
    pub phases: Vec<PhaseSummary>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPlanEntry {
    pub id: String,
    pub plan_id: String,
    pub seq: i64,
    pub file_path: String,
    pub phase: Phase,
    pub operation: Value,
    /// The operation holds the file's unparsed text instead of a JSON record.
    pub raw: bool,
    pub remote_record_id: Option<String>,
    pub data_folder_id: Option<String>,
    pub status: EntryStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEntry {
    pub file_path: String,
    pub phase: Phase,
    pub operation: Value,
    pub raw: bool,
    pub remote_record_id: Option<String>,
    pub data_folder_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryCounts {
    pub pending: usize,
    pub success: usize,
    pub failed_batch: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPlanInfo {
    #[serde(flatten)]
    pub plan: PublishPlan,
    pub entry_counts: EntryCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndexEntry {
    pub workbook_id: String,
    pub folder_path: String,
    pub filename: String,
    pub record_id: String,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    pub workbook_id: String,
    pub branch: Branch,
    pub source_file_path: String,
    pub target_folder_path: String,
    pub target_file_name: Option<String>,
    pub target_file_record_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefTarget {
    pub folder_path: String,
    pub file_name: Option<String>,
    pub record_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefSource {
    pub source_file_path: String,
    pub branch: Branch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFolder {
    pub id: String,
    #[serde(default)]
    pub workbook_id: String,
    pub name: String,
    pub path: String,
    pub connector_account_id: Option<String>,
    #[serde(default)]
    pub schema: Value,
    pub id_column_remote_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorAccount {
    pub id: String,
    pub service: String,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub create_batch_size: usize,
    pub update_batch_size: usize,
    pub delete_batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoChange {
    pub path: String,
    pub status: ChangeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoFile {
    pub path: String,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWrite {
    pub path: String,
    pub content: String,
}

pub fn split_file_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}

pub fn join_file_path(folder_path: &str, filename: &str) -> String {
    let folder = folder_path.trim_matches('/');
    if folder.is_empty() {
        filename.to_string()
    } else {
        format!("{folder}/{filename}")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanRequest {
    pub user_id: String,
    pub connector_account_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPlanRequest {
    pub phase: Option<Phase>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPlansQuery {
    pub connector_account_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleEntriesQuery {
    pub before: DateTime<Utc>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAcceptedResponse {
    pub plan_id: String,
    pub phase: Option<Phase>,
    pub status: PlanStatus,
    pub queued_at: DateTime<Utc>,
}
