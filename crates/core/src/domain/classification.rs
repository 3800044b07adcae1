use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Category,
    Segment,
}

impl GroupBy {
    pub const ALL: [GroupBy; 2] = [GroupBy::Category, GroupBy::Segment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Segment => "segment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "category" => Some(Self::Category),
            "segment" => Some(Self::Segment),
            _ => None,
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slash separated node path in a classification tree, e.g. `1/2/3`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupPath(String);

impl GroupPath {
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.split('/').any(|segment| segment.trim().is_empty()) {
            return Err(DomainError::InvalidGroupPath(value.to_owned()));
        }
        Ok(Self(trimmed.split('/').map(str::trim).collect::<Vec<_>>().join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Every ancestor path including the path itself, root first.
    pub fn prefixes(&self) -> Vec<GroupPath> {
        let segments: Vec<&str> = self.segments().collect();
        (1..=segments.len()).map(|len| GroupPath(segments[..len].join("/"))).collect()
    }

    /// Segment-wise prefix test: `1/2` is a prefix of `1/2/3` but not of `1/23`.
    pub fn is_prefix_of(&self, other: &GroupPath) -> bool {
        other.0 == self.0
            || (other.0.starts_with(&self.0) && other.0.as_bytes().get(self.0.len()) == Some(&b'/'))
    }
}

impl fmt::Display for GroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for GroupPath {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<GroupPath> for String {
    fn from(value: GroupPath) -> Self {
        value.0
    }
}

/// The current category and segment placement of one SKU for one month.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuClassification {
    pub category: Option<GroupPath>,
    pub segment: Option<GroupPath>,
}

impl SkuClassification {
    pub fn path(&self, group_by: GroupBy) -> Option<&GroupPath> {
        match group_by {
            GroupBy::Category => self.category.as_ref(),
            GroupBy::Segment => self.segment.as_ref(),
        }
    }

    pub fn is_unclassified(&self) -> bool {
        self.category.is_none() && self.segment.is_none()
    }

    /// True when `group_key` is the SKU's path or one of its ancestors.
    pub fn belongs_to(&self, group_by: GroupBy, group_key: &GroupPath) -> bool {
        self.path(group_by).is_some_and(|path| group_key.is_prefix_of(path))
    }
}

/// SKU -> classification for one seller and month.
pub type ClassificationMap = BTreeMap<String, SkuClassification>;
