//! Reporter roster and the calendar's reporter filter.

use serde::{Deserialize, Serialize};

/// One of the eight reporters a lead or event can be assigned to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Reporter {
    #[default]
    #[serde(rename = "孟祥宇")]
    MengXiangyu,
    #[serde(rename = "江虹")]
    JiangHong,
    #[serde(rename = "陳筱雯")]
    ChenXiaowen,
    #[serde(rename = "方凱琪")]
    FangKaiqi,
    #[serde(rename = "呂詠倢")]
    LyuYongjie,
    #[serde(rename = "林婷妤")]
    LinTingyu,
    #[serde(rename = "黃易麒")]
    HuangYiqi,
    #[serde(rename = "林家慶")]
    LinJiaqing,
}

impl Reporter {
    pub const ALL: [Reporter; 8] = [
        Reporter::MengXiangyu,
        Reporter::JiangHong,
        Reporter::ChenXiaowen,
        Reporter::FangKaiqi,
        Reporter::LyuYongjie,
        Reporter::LinTingyu,
        Reporter::HuangYiqi,
        Reporter::LinJiaqing,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Reporter::MengXiangyu => "孟祥宇",
            Reporter::JiangHong => "江虹",
            Reporter::ChenXiaowen => "陳筱雯",
            Reporter::FangKaiqi => "方凱琪",
            Reporter::LyuYongjie => "呂詠倢",
            Reporter::LinTingyu => "林婷妤",
            Reporter::HuangYiqi => "黃易麒",
            Reporter::LinJiaqing => "林家慶",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Reporter::ALL.into_iter().find(|r| r.name() == name)
    }

    /// Login e-mail the reporter's account was provisioned with.
    pub fn email(&self) -> &'static str {
        match self {
            Reporter::MengXiangyu => "mengxiangyu@news.com",
            Reporter::JiangHong => "jianghong@news.com",
            Reporter::ChenXiaowen => "chenxiaowen@news.com",
            Reporter::FangKaiqi => "fangkaiqi@news.com",
            Reporter::LyuYongjie => "lvyongjie@news.com",
            Reporter::LinTingyu => "lintingyu@news.com",
            Reporter::HuangYiqi => "huangyiqi@news.com",
            Reporter::LinJiaqing => "linjiaqing@news.com",
        }
    }
}

impl std::fmt::Display for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Calendar filter selection. `All` exists only in the filter and is never stored on a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReporterFilter {
    #[default]
    All,
    Only(Reporter),
}

impl ReporterFilter {
    pub const ALL_LABEL: &'static str = "全部";

    pub fn label(&self) -> &'static str {
        match self {
            ReporterFilter::All => Self::ALL_LABEL,
            ReporterFilter::Only(reporter) => reporter.name(),
        }
    }

    /// Parse a selector value; unknown names yield `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        if label == Self::ALL_LABEL {
            return Some(ReporterFilter::All);
        }
        Reporter::from_name(label).map(ReporterFilter::Only)
    }

    /// Selector entries in display order.
    pub fn options() -> Vec<ReporterFilter> {
        std::iter::once(ReporterFilter::All)
            .chain(Reporter::ALL.into_iter().map(ReporterFilter::Only))
            .collect()
    }

    pub fn matches(&self, reporter: Reporter) -> bool {
        match self {
            ReporterFilter::All => true,
            ReporterFilter::Only(selected) => *selected == reporter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_serializes_as_name() {
        let json = serde_json::to_string(&Reporter::JiangHong).unwrap();
        assert_eq!(json, "\"江虹\"");

        let parsed: Reporter = serde_json::from_str("\"林家慶\"").unwrap();
        assert_eq!(parsed, Reporter::LinJiaqing);
    }

    #[test]
    fn test_all_is_not_a_reporter() {
        assert!(serde_json::from_str::<Reporter>("\"全部\"").is_err());
        assert_eq!(ReporterFilter::from_label("全部"), Some(ReporterFilter::All));
    }

    #[test]
    fn test_filter_options_start_with_all() {
        let options = ReporterFilter::options();
        assert_eq!(options.len(), 9);
        assert_eq!(options[0], ReporterFilter::All);
        assert_eq!(options[1].label(), "孟祥宇");
    }

    #[test]
    fn test_filter_matches() {
        assert!(ReporterFilter::All.matches(Reporter::HuangYiqi));
        assert!(ReporterFilter::Only(Reporter::HuangYiqi).matches(Reporter::HuangYiqi));
        assert!(!ReporterFilter::Only(Reporter::HuangYiqi).matches(Reporter::JiangHong));
    }
}
