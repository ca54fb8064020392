//! The project aggregate and the legacy document shape it replaced.
//!
//! Older documents stored a single flat `pattern` list on the project. Those
//! are still accepted anywhere a project is deserialized from outside the
//! process (cache snapshots, remote reads) through [`StoredProject`], and
//! converted exactly once with [`migrate`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pattern::{Chart, Round};

pub type ProjectId = String;

const LEGACY_CHART_NAME: &str = "Main chart";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Yarn {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<String>,
}

/// A timed stretch of knitting on a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rounds_completed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub yarns: Vec<Yarn>,
    #[serde(default)]
    pub sessions: Vec<WorkSession>,
    pub charts: Vec<Chart>,
    /// The chart progress is tracked against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chart_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Project {
    /// A fresh project with one empty chart selected as current.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        let chart = Chart::new(LEGACY_CHART_NAME);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: now,
            last_modified: now,
            yarns: Vec::new(),
            sessions: Vec::new(),
            current_chart_id: Some(chart.id.clone()),
            charts: vec![chart],
            notes: None,
        }
    }

    pub fn current_chart(&self) -> Option<&Chart> {
        match &self.current_chart_id {
            Some(id) => self.charts.iter().find(|c| &c.id == id),
            None => self.charts.first(),
        }
    }

    pub fn current_chart_mut(&mut self) -> Option<&mut Chart> {
        let index = match &self.current_chart_id {
            Some(id) => self.charts.iter().position(|c| &c.id == id)?,
            None if self.charts.is_empty() => return None,
            None => 0,
        };
        self.charts.get_mut(index)
    }

    /// Add a chart; the first chart of a project becomes current.
    pub fn add_chart(&mut self, chart: Chart) {
        if self.current_chart().is_none() {
            self.current_chart_id = Some(chart.id.clone());
        }
        self.charts.push(chart);
    }

    /// Returns false (and leaves the selection alone) for an unknown chart.
    pub fn select_chart(&mut self, chart_id: &str) -> bool {
        if self.charts.iter().any(|c| c.id == chart_id) {
            self.current_chart_id = Some(chart_id.to_string());
            true
        } else {
            false
        }
    }

    pub fn stamp(&mut self, at: DateTime<Utc>) {
        self.last_modified = at;
    }
}

/// Pre-chart document layout: one flat round list per project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyProject {
    pub id: ProjectId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub yarns: Vec<Yarn>,
    #[serde(default)]
    pub sessions: Vec<WorkSession>,
    #[serde(default)]
    pub pattern: Vec<Round>,
    #[serde(default = "first_round")]
    pub current_round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn first_round() -> u32 {
    1
}

/// A project document as read from outside the process.
///
/// `Current` is tried first; it requires `charts`, which legacy documents
/// never carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredProject {
    Current(Project),
    Legacy(LegacyProject),
}

impl StoredProject {
    pub fn id(&self) -> &str {
        match self {
            StoredProject::Current(p) => &p.id,
            StoredProject::Legacy(p) => &p.id,
        }
    }

    pub fn into_project(self) -> Project {
        match self {
            StoredProject::Current(project) => project,
            StoredProject::Legacy(legacy) => {
                tracing::info!("Migrating legacy project {} to chart format", legacy.id);
                migrate(legacy)
            }
        }
    }
}

impl From<Project> for StoredProject {
    fn from(project: Project) -> Self {
        StoredProject::Current(project)
    }
}

/// Convert a legacy document into the chart layout. Timestamps are kept, so
/// a migrated project does not look newer than its remote copy.
pub fn migrate(legacy: LegacyProject) -> Project {
    let mut chart = Chart::from_rounds(LEGACY_CHART_NAME, legacy.pattern, legacy.current_round);
    chart.created_at = legacy.created_at;
    chart.last_modified = legacy.last_modified;

    Project {
        id: legacy.id,
        name: legacy.name,
        created_at: legacy.created_at,
        last_modified: legacy.last_modified,
        yarns: legacy.yarns,
        sessions: legacy.sessions,
        current_chart_id: Some(chart.id.clone()),
        charts: vec![chart],
        notes: legacy.notes,
    }
}
