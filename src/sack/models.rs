/// Persisted document types
///
/// Every field carries a serde default so that projected documents (a url and a
/// score, say) still decode. Derived and transient fields are skipped when
/// absent; "field missing" is how the rectifier finds work.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::store::query::Filter;
use crate::store::Identity;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Article,
    Post,
    Comment,
    Channel,
    #[default]
    #[serde(other)]
    Invalid,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Article => "article",
            Kind::Post => "post",
            Kind::Comment => "comment",
            Kind::Channel => "channel",
            Kind::Invalid => "invalid",
        }
    }
}

/// A news article or social media post.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bean {
    pub url: String,
    /// Seconds since epoch of the last (re-)ingest
    pub updated: i64,
    /// Seconds since epoch of the original publication
    pub created: i64,
    pub source: String,
    pub title: String,
    pub author: String,
    pub text: String,
    pub kind: Kind,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_embeddings: Option<Vec<f32>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_noise: Option<MediaNoise>,
}

/// Engagement signal attached to a bean.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaNoise {
    pub mapped_url: String,
    pub updated: i64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_url: Option<String>,
    pub comments: i64,
    pub likes: i64,
    pub likes_ratio: f64,
    pub subscribers: i64,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl MediaNoise {
    /// `likes + 3 * comments`
    pub fn score(likes: i64, comments: i64) -> i64 {
        likes + 3 * comments
    }
}

/// A keyconcept with its trend score and the beans it maps to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeanNugget {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub keyphrase: String,
    pub event: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<f32>>,
    pub updated: i64,
    pub match_count: i64,
    pub mapped_urls: Vec<String>,
}

impl BeanNugget {
    pub fn digest(&self) -> String {
        format!("{} {}: {}", self.keyphrase, self.event, self.description)
    }
}

/// Bean fields computed after insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratedField {
    CategoryEmbeddings,
    Summary,
}

impl GeneratedField {
    /// Generation order for new beans.
    pub const ALL: [GeneratedField; 2] = [GeneratedField::CategoryEmbeddings, GeneratedField::Summary];

    pub fn field_name(&self) -> &'static str {
        match self {
            GeneratedField::CategoryEmbeddings => "category_embeddings",
            GeneratedField::Summary => "summary",
        }
    }
}

/// Beans are identified by url.
pub struct UrlIdentity;

impl Identity<Bean> for UrlIdentity {
    fn id_of(&self, item: &Bean) -> Filter {
        Filter::eq("url", item.url.as_str())
    }

    fn equals(&self, a: &Bean, b: &Bean) -> bool {
        a.url == b.url
    }
}

/// Current time in seconds since epoch.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// `updated >= now - days`
pub fn updated_in_last(days: i64) -> Filter {
    Filter::gte("updated", (Utc::now() - Duration::days(days)).timestamp())
}
