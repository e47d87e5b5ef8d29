//! Parameter and result records, one pair per operation.

use serde::{Deserialize, Serialize};

use crate::types::{
    CallTreeNode, FunctionNode, FunctionsSortBy, HitCounts, LineHits, ModuleFilterMode,
    ProcessFunction, ProcessInfo, ProcessSampleInfo, SampleSourceInfo, SessionInfo, SortDirection,
    SystemInfo,
};

/// Opaque correlation value letting the engine report incremental progress
/// (and the client request cancellation) for one specific in-flight call.
pub type ProgressToken = String;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadDocumentParams {
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_done_token: Option<ProgressToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadDocumentResult {
    pub document_id: u32,
}

/// Shared parameter shape for the per-document queries that need nothing
/// beyond the document id from `readDocument`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentParams {
    pub document_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveSampleSourcesResult {
    pub sample_sources: Vec<SampleSourceInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveSessionInfoResult {
    pub session_info: SessionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveSystemInfoResult {
    pub system_info: SystemInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveProcessesResult {
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetSampleFiltersParams {
    pub document_id: u32,
    // Nanoseconds since session start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time: Option<u64>,
    pub excluded_processes: Vec<u64>,
    pub excluded_threads: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveHottestFunctionsParams {
    pub document_id: u32,
    pub source_id: u64,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_done_token: Option<ProgressToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveHottestFunctionsResult {
    pub functions: Vec<ProcessFunction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveProcessSampleInfoParams {
    pub document_id: u32,
    pub process_key: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveProcessSampleInfoResult {
    pub info: ProcessSampleInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveCallTreeHotPathParams {
    pub document_id: u32,
    pub source_id: u64,
    pub process_key: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_done_token: Option<ProgressToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveCallTreeHotPathResult {
    pub root: CallTreeNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveFunctionsPageParams {
    pub document_id: u32,
    pub sort_by: FunctionsSortBy,
    pub sort_order: SortDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_source_id: Option<u64>,
    pub process_key: u64,
    pub page_size: u32,
    pub page_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_done_token: Option<ProgressToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveFunctionsPageResult {
    pub functions: Vec<FunctionNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandCallTreeNodeParams {
    pub document_id: u32,
    pub process_key: u64,
    pub node_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_done_token: Option<ProgressToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandCallTreeNodeResult {
    pub children: Vec<CallTreeNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveCallersCalleesParams {
    pub document_id: u32,
    pub sort_source_id: u64,
    pub process_key: u64,
    pub function_id: u64,
    pub max_entries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_done_token: Option<ProgressToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveCallersCalleesResult {
    pub function: FunctionNode,
    pub callers: Vec<FunctionNode>,
    pub callees: Vec<FunctionNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveLineInfoParams {
    pub document_id: u32,
    pub process_key: u64,
    pub function_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_done_token: Option<ProgressToken>,
}

/// `retrieveLineInfo` answers `null` when the engine has no line-level
/// data for the function; callers see that as `Option::None`, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveLineInfoResult {
    pub file_path: String,
    pub line_number: u32,
    pub hits: Vec<HitCounts>,
    pub line_hits: Vec<LineHits>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseDocumentParams {
    pub document_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModulePathMapsParams {
    pub simple_maps: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPdbSymbolFindOptionsParams {
    pub search_dirs: Vec<String>,
    pub no_default_urls: bool,
    pub symbol_server_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_cache_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDwarfSymbolFindOptionsParams {
    pub search_dirs: Vec<String>,
    pub no_default_urls: bool,
    pub debuginfod_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debuginfod_cache_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModuleFiltersParams {
    pub mode: ModuleFilterMode,
    // Wildcards supported (as in "*.exe").
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Cancels the in-flight request with the given correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkDoneProgress {
    #[serde(rename_all = "camelCase")]
    Begin {
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cancellable: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        percentage: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Report {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        percentage: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    End {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Server-emitted progress notification, keyed by the token the client
/// attached to the originating request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressParams {
    pub token: ProgressToken,
    pub value: WorkDoneProgress,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_progress_token_stays_off_the_wire() {
        let params = ReadDocumentParams {
            file_path: "/tmp/run.perf".into(),
            work_done_token: None,
        };
        let encoded = serde_json::to_value(&params).unwrap();
        assert_eq!(encoded, json!({"filePath": "/tmp/run.perf"}));
    }

    #[test]
    fn progress_events_parse_by_kind() {
        let begin: WorkDoneProgress = serde_json::from_value(json!({
            "kind": "begin",
            "title": "Reading document",
            "cancellable": true,
            "percentage": 0.0,
        }))
        .unwrap();
        assert!(matches!(begin, WorkDoneProgress::Begin { .. }));

        let report: WorkDoneProgress =
            serde_json::from_value(json!({"kind": "report", "percentage": 40.0})).unwrap();
        assert!(matches!(
            report,
            WorkDoneProgress::Report {
                percentage: Some(p),
                ..
            } if p == 40.0
        ));

        let end: WorkDoneProgress = serde_json::from_value(json!({"kind": "end"})).unwrap();
        assert!(matches!(end, WorkDoneProgress::End { message: None }));
    }

    #[test]
    fn path_maps_serialize_as_pairs() {
        let params = SetModulePathMapsParams {
            simple_maps: vec![("/mnt/c/".into(), "C:/".into())],
        };
        let encoded = serde_json::to_value(&params).unwrap();
        assert_eq!(encoded, json!({"simpleMaps": [["/mnt/c/", "C:/"]]}));
    }

    #[test]
    fn line_info_result_accepts_null() {
        let missing: Option<RetrieveLineInfoResult> = serde_json::from_value(json!(null)).unwrap();
        assert!(missing.is_none());
    }
}
