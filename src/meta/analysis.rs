//! Analysis results embedded in the trailer and returned by the facade.
//!
//! Two depths exist: a quick inspection stops as soon as the first XY move
//! is known, a full analysis runs the whole stream. The JSON shape is
//! consumed by the printer host, so field names are camelCase and the
//! payload is schema-versioned.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Version of the JSON schema written into the trailer payload.
pub const ANALYSIS_SCHEMA_VERSION: u32 = 1;

/// Outcome of a stream pass, tagged by depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AnalysisResult {
    #[serde(rename = "quick")]
    Quick(QuickAnalysis),
    #[serde(rename = "full")]
    Full(FullAnalysis),
}

impl AnalysisResult {
    pub fn schema_version(&self) -> u32 {
        match self {
            Self::Quick(quick) => quick.version,
            Self::Full(full) => full.version,
        }
    }

    pub fn first_move_x(&self) -> Option<f64> {
        match self {
            Self::Quick(quick) => quick.first_move_x,
            Self::Full(full) => full.first_move_x,
        }
    }

    pub fn first_move_y(&self) -> Option<f64> {
        match self {
            Self::Quick(quick) => quick.first_move_y,
            Self::Full(full) => full.first_move_y,
        }
    }

    pub fn used_tools(&self) -> &[String] {
        match self {
            Self::Quick(_) => &[],
            Self::Full(full) => &full.used_tools,
        }
    }

    pub fn tool_change_count(&self) -> u32 {
        match self {
            Self::Quick(_) => 0,
            Self::Full(full) => full.tool_change_count,
        }
    }
}

/// Fields a quick inspection can latch before bailing out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickAnalysis {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extruder_temps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_move_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_move_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub has_purge_tower: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub slicer_config: Option<BTreeMap<String, String>>,
}

/// Everything a full stream pass collects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullAnalysis {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extruder_temps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_move_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_move_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub has_purge_tower: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub slicer_config: Option<BTreeMap<String, String>>,
    pub tool_change_count: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub min_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_x: Option<f64>,
    /// Tools in order of first use, no duplicates.
    pub used_tools: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_analysis_json_shape() {
        let analysis = AnalysisResult::Full(FullAnalysis {
            version: ANALYSIS_SCHEMA_VERSION,
            extruder_temps: Some(vec!["210".into(), "215".into()]),
            first_move_x: Some(10.0),
            first_move_y: Some(20.0),
            has_purge_tower: Some(false),
            slicer_config: None,
            tool_change_count: 3,
            min_x: Some(1.5),
            max_x: Some(180.0),
            used_tools: vec!["0".into(), "1".into()],
        });

        let json = serde_json::to_value(&analysis).unwrap();
        assert_eq!(json["kind"], "full");
        assert_eq!(json["version"], 1);
        assert_eq!(json["toolChangeCount"], 3);
        assert_eq!(json["usedTools"][1], "1");
        assert_eq!(json["firstMoveX"], 10.0);

        let back: AnalysisResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, analysis);
    }

    #[test]
    fn test_quick_analysis_omits_absent_fields() {
        let analysis = AnalysisResult::Quick(QuickAnalysis {
            version: ANALYSIS_SCHEMA_VERSION,
            extruder_temps: None,
            first_move_x: Some(5.0),
            first_move_y: Some(5.0),
            has_purge_tower: None,
            slicer_config: None,
        });
        let json = serde_json::to_string(&analysis).unwrap();
        assert!(json.contains("\"kind\":\"quick\""));
        assert!(!json.contains("extruderTemps"));
        assert!(!json.contains("hasPurgeTower"));
    }
}
