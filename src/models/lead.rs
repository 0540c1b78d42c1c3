//! Lead model: a candidate news item tracked through pre-interview and acceptance.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Record, Reporter, SortKey, Table};
use crate::errors::SyncError;

/// Pipeline status of a lead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    #[default]
    NotPreCollected,
    Accepted,
    Rejected,
    WaitingReply,
    WelfareLead,
    SpecialSituation,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 6] = [
        LeadStatus::NotPreCollected,
        LeadStatus::Accepted,
        LeadStatus::Rejected,
        LeadStatus::WaitingReply,
        LeadStatus::WelfareLead,
        LeadStatus::SpecialSituation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::NotPreCollected => "not_pre_collected",
            LeadStatus::Accepted => "accepted",
            LeadStatus::Rejected => "rejected",
            LeadStatus::WaitingReply => "waiting_reply",
            LeadStatus::WelfareLead => "welfare_lead",
            LeadStatus::SpecialSituation => "special_situation",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        LeadStatus::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Label shown on the board and matched by the search box.
    pub fn label(&self) -> &'static str {
        match self {
            LeadStatus::NotPreCollected => "未預採",
            LeadStatus::Accepted => "接受",
            LeadStatus::Rejected => "拒訪",
            LeadStatus::WaitingReply => "等待回覆",
            LeadStatus::WelfareLead => "福利線",
            LeadStatus::SpecialSituation => "特殊狀況",
        }
    }
}

/// Newsroom desk a lead belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    #[default]
    Knowledge,
    Sports,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Knowledge => "knowledge",
            Section::Sports => "sports",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Section::Knowledge => "新知",
            Section::Sports => "體育",
        }
    }
}

/// Issue numbers offered by the lead dialog.
pub const ISSUE_CHOICES: std::ops::RangeInclusive<i32> = 1813..=1822;

/// Issue number preselected for a new lead.
pub const DEFAULT_ISSUE: i32 = 1820;

/// A lead row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub id: String,
    pub title: String,
    pub status: LeadStatus,
    pub reporter: Reporter,
    pub issue_number: i32,
    pub section: Section,
    #[serde(default)]
    pub links: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Identity that created the row; set by the gateway, never changed afterwards
    pub created_by: String,
}

/// Fields supplied when creating a lead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewLead {
    pub title: String,
    pub status: LeadStatus,
    pub reporter: Reporter,
    pub issue_number: i32,
    pub section: Section,
    #[serde(default)]
    pub links: Vec<String>,
}

impl Default for NewLead {
    fn default() -> Self {
        Self {
            title: String::new(),
            status: LeadStatus::default(),
            reporter: Reporter::default(),
            issue_number: DEFAULT_ISSUE,
            section: Section::default(),
            links: Vec::new(),
        }
    }
}

impl NewLead {
    /// Trim the title and drop blank links, as the dialog does before saving.
    pub fn normalized(mut self) -> Self {
        self.title = self.title.trim().to_string();
        self.links = normalize_links(self.links);
        self
    }
}

/// Partial update of a lead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LeadPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LeadStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<Reporter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<String>>,
}

impl LeadPatch {
    /// Patch that overwrites every editable field, as a dialog save does.
    pub fn from_form(form: NewLead) -> Self {
        let form = form.normalized();
        Self {
            title: Some(form.title),
            status: Some(form.status),
            reporter: Some(form.reporter),
            issue_number: Some(form.issue_number),
            section: Some(form.section),
            links: Some(form.links),
        }
    }

    pub fn normalized(mut self) -> Self {
        self.title = self.title.map(|t| t.trim().to_string());
        self.links = self.links.map(normalize_links);
        self
    }
}

fn normalize_links(links: Vec<String>) -> Vec<String> {
    links
        .into_iter()
        .map(|link| link.trim().to_string())
        .filter(|link| !link.is_empty())
        .collect()
}

impl Lead {
    /// Form values for editing this lead.
    pub fn to_form(&self) -> NewLead {
        NewLead {
            title: self.title.clone(),
            status: self.status,
            reporter: self.reporter,
            issue_number: self.issue_number,
            section: self.section,
            links: self.links.clone(),
        }
    }
}

impl Record for Lead {
    type Draft = NewLead;
    type Patch = LeadPatch;

    const TABLE: Table = Table::Leads;
    const SORT: SortKey = SortKey {
        column: "created_at",
        ascending: false,
    };

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn created_by(&self) -> &str {
        &self.created_by
    }

    fn apply_patch(&mut self, patch: &LeadPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(reporter) = patch.reporter {
            self.reporter = reporter;
        }
        if let Some(issue_number) = patch.issue_number {
            self.issue_number = issue_number;
        }
        if let Some(section) = patch.section {
            self.section = section;
        }
        if let Some(links) = &patch.links {
            self.links = links.clone();
        }
    }

    /// Newest first.
    fn sort_cmp(a: &Self, b: &Self) -> Ordering {
        b.created_at.cmp(&a.created_at)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.title.trim().is_empty() {
            return Err(SyncError::Validation("Title is required".to_string()));
        }
        Ok(())
    }

    fn preview(draft: &NewLead) -> Self {
        let now = Utc::now();
        Lead {
            id: String::new(),
            title: draft.title.clone(),
            status: draft.status,
            reporter: draft.reporter,
            issue_number: draft.issue_number,
            section: draft.section,
            links: draft.links.clone(),
            created_at: now,
            updated_at: now,
            created_by: String::new(),
        }
    }
}
