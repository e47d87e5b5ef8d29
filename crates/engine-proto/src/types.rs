use serde::{Deserialize, Serialize};

/// One independent channel of collected samples (CPU time, a hardware
/// counter, ...) with its own hit-count aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleSourceInfo {
    pub id: u64,
    pub name: String,
    pub number_of_samples: u64,
    pub average_sampling_rate: f64,
    /// Whether call-stack ("total") aggregation is meaningful for this
    /// source. Self-only sources cannot aggregate beyond the leaf.
    pub has_stacks: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadInfo {
    pub key: u64,
    pub os_id: u64,
    // Nanoseconds since session start.
    pub start_time: u64,
    pub end_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub key: u64,
    pub os_id: u64,
    pub name: String,
    // Nanoseconds since session start.
    pub start_time: u64,
    pub end_time: u64,
    pub threads: Vec<ThreadInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub command_line: String,
    pub date: String,
    /// Session runtime in nanoseconds.
    pub runtime: u64,
    pub number_of_processes: u32,
    pub number_of_threads: u32,
    pub number_of_samples: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub hostname: String,
    pub platform: String,
    pub architecture: String,
    pub cpu_name: String,
    pub number_of_processors: u32,
}

/// Self/total sample counts and percentages for one sample source.
/// Functions, tree nodes and lines carry one entry per active source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitCounts {
    pub source_id: u64,
    pub total_samples: u64,
    pub self_samples: u64,
    pub total_percent: f64,
    pub self_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionNode {
    pub name: String,
    pub id: u64,
    pub module: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub hits: Vec<HitCounts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTreeNode {
    pub name: String,
    pub id: u64,
    pub function_id: u64,
    pub module: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub hits: Vec<HitCounts>,
    pub is_hot: bool,
    /// `None` means "not yet expanded"; `Some(vec![])` means the node
    /// genuinely has no children. The distinction must survive the wire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<CallTreeNode>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessFunction {
    pub process_key: u64,
    pub function: FunctionNode,
}

/// Per-line sample hits. Line numbers are 1-based; the engine may emit
/// sentinel values (max-int and friends), so this stays a signed 64-bit
/// field and consumers validate before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineHits {
    pub line_number: i64,
    pub hits: Vec<HitCounts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSampleInfo {
    pub key: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub hits: Vec<HitCounts>,
}

/// Sample hit totals for one process and each of its threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSampleInfo {
    pub process_key: u64,
    pub hits: Vec<HitCounts>,
    pub threads: Vec<ThreadSampleInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleFilterMode {
    #[default]
    AllButExcluded,
    OnlyIncluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionsSortBy {
    Name,
    SelfSamples,
    TotalSamples,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_fields_are_camel_case() {
        let source = SampleSourceInfo {
            id: 1,
            name: "cpu".into(),
            number_of_samples: 4200,
            average_sampling_rate: 997.3,
            has_stacks: true,
        };
        let encoded = serde_json::to_value(&source).unwrap();
        assert_eq!(
            encoded,
            json!({
                "id": 1,
                "name": "cpu",
                "numberOfSamples": 4200,
                "averageSamplingRate": 997.3,
                "hasStacks": true,
            })
        );
    }

    #[test]
    fn enums_use_snake_case_strings() {
        assert_eq!(
            serde_json::to_value(ModuleFilterMode::AllButExcluded).unwrap(),
            json!("all_but_excluded")
        );
        assert_eq!(
            serde_json::to_value(FunctionsSortBy::SelfSamples).unwrap(),
            json!("self_samples")
        );
        assert_eq!(
            serde_json::to_value(SortDirection::Descending).unwrap(),
            json!("descending")
        );
    }

    #[test]
    fn children_tri_state_survives_round_trip() {
        let leaf = CallTreeNode {
            name: "leaf".into(),
            id: 2,
            function_id: 20,
            module: "app".into(),
            kind: "function".into(),
            hits: vec![],
            is_hot: false,
            children: Some(vec![]),
        };
        let unexpanded = CallTreeNode {
            children: None,
            ..leaf.clone()
        };

        let leaf_json = serde_json::to_value(&leaf).unwrap();
        let unexpanded_json = serde_json::to_value(&unexpanded).unwrap();
        assert_eq!(leaf_json["children"], json!([]));
        assert!(unexpanded_json.get("children").is_none());

        let leaf_back: CallTreeNode = serde_json::from_value(leaf_json).unwrap();
        let unexpanded_back: CallTreeNode = serde_json::from_value(unexpanded_json).unwrap();
        assert_eq!(leaf_back.children, Some(vec![]));
        assert_eq!(unexpanded_back.children, None);
    }

    #[test]
    fn node_type_field_keeps_wire_name() {
        let function = FunctionNode {
            name: "main".into(),
            id: 9,
            module: "app".into(),
            kind: "function".into(),
            hits: vec![],
        };
        let encoded = serde_json::to_value(&function).unwrap();
        assert_eq!(encoded["type"], json!("function"));
    }

    #[test]
    fn sentinel_line_numbers_deserialize() {
        let hit: LineHits =
            serde_json::from_value(json!({"lineNumber": 4294967295u32 as i64, "hits": []}))
                .unwrap();
        assert_eq!(hit.line_number, 4294967295);
    }
}
