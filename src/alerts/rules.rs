use crate::db::models::{CameraKey, RuleScope, Severity};
use crate::ingest::mac::normalize_mac;
use std::fmt::{Display, Formatter};

const DEFAULT_TITLE_TEMPLATE: &str = "[AUTO] {rule}: {subject}";

/// Fields of an inbound record that a rule scope can pin
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRecord {
    pub device: Option<String>,
    pub tag: Option<String>,
    pub camera: Option<String>,
    pub analytic: Option<String>,
    pub building: Option<String>,
}

fn field_matches(expected: &Option<String>, actual: &Option<String>, mac: bool) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let Some(actual) = actual else {
        return false;
    };
    if mac {
        let expected = normalize_mac(expected).unwrap_or_else(|| expected.clone());
        expected == *actual
    } else {
        expected == actual
    }
}

impl RuleScope {
    /// True when every present scope field equals the record's field
    pub fn matches(&self, record: &MatchRecord) -> bool {
        field_matches(&self.device, &record.device, true)
            && field_matches(&self.tag, &record.tag, true)
            && field_matches(&self.camera, &record.camera, false)
            && field_matches(&self.analytic, &record.analytic, false)
            && field_matches(&self.building, &record.building, false)
    }
}

/// Entity a rule fired for. The display form is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Pair { tag: String, device: String },
    Tag(String),
    Gateway(String),
    Camera(CameraKey),
}

impl Display for Subject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pair { tag, device } => write!(f, "pair:{}@{}", tag, device),
            Self::Tag(mac) => write!(f, "tag:{}", mac),
            Self::Gateway(mac) => write!(f, "gateway:{}", mac),
            Self::Camera(key) => write!(f, "camera:{}", key),
        }
    }
}

/// Fill `{rule}`, `{subject}` and `{severity}` placeholders
pub fn render_title(template: Option<&str>, rule: &str, subject: &Subject, severity: Severity) -> String {
    let template = template
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(DEFAULT_TITLE_TEMPLATE);
    template
        .replace("{rule}", rule)
        .replace("{subject}", &subject.to_string())
        .replace("{severity}", &severity.to_string())
}
