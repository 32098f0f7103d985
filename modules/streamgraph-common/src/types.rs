use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Raw stream messages (wire shape of the upstream post API)
// ---------------------------------------------------------------------------

/// One element delivered by the upstream stream.
///
/// A JSON object carrying both `id_str` and `user` is post-shaped. It becomes
/// `Post` when it decodes, `Malformed` when one of its fields has the wrong type.
/// Every other JSON value (keep-alives, delete/limit notices, control messages)
/// lands in `Other` and is skipped before normalization.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StreamMessage {
    Post(Box<RawPost>),
    #[serde(skip_serializing)]
    Malformed {
        reason: String,
        raw: serde_json::Value,
    },
    Other(serde_json::Value),
}

impl StreamMessage {
    /// Decode one newline-delimited JSON message. Fails only on invalid JSON.
    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        Ok(Self::from_value(value))
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        let post_shaped = value.get("id_str").is_some() && value.get("user").is_some();
        if !post_shaped {
            return StreamMessage::Other(value);
        }
        match RawPost::deserialize(&value) {
            Ok(post) => StreamMessage::Post(Box::new(post)),
            Err(e) => StreamMessage::Malformed {
                reason: e.to_string(),
                raw: value,
            },
        }
    }

    pub fn as_post(&self) -> Option<&RawPost> {
        match self {
            StreamMessage::Post(post) => Some(post),
            StreamMessage::Malformed { .. } | StreamMessage::Other(_) => None,
        }
    }
}

/// Treat an explicit `null` like an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPost {
    pub id_str: String,
    /// Kept as raw JSON: the normalizer reports a non-string value as a malformed timestamp.
    #[serde(default)]
    pub created_at: serde_json::Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_tweet: Option<RawExtendedText>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub retweeted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retweeted_status: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub entities: RawEntities,
    pub user: RawUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExtendedText {
    #[serde(default)]
    pub full_text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEntities {
    #[serde(default, deserialize_with = "null_as_default")]
    pub urls: Vec<RawUrl>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hashtags: Vec<RawHashtag>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_mentions: Vec<RawMention>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawUrl {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub expanded_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHashtag {
    #[serde(default, deserialize_with = "null_as_default")]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMention {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id_str: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub screen_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawUser {
    pub id_str: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub screen_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub friends_count: Option<i64>,
    #[serde(default)]
    pub followers_count: Option<i64>,
    #[serde(default)]
    pub verified: Option<bool>,
    #[serde(default)]
    pub profile_banner_url: Option<String>,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Canonical records
// ---------------------------------------------------------------------------

/// A social-media account as written to the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub external_id: String,
    pub display_name: Option<String>,
    pub handle: Option<String>,
    pub bio: Option<String>,
    pub profile_image_url: Option<String>,
    pub profile_banner_url: Option<String>,
    pub follower_count: Option<i64>,
    pub following_count: Option<i64>,
    pub verified: Option<bool>,
}

impl UserRecord {
    /// A user known only by its external id.
    pub fn with_id(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            ..Default::default()
        }
    }

    /// Fill attributes that are still absent from `other`. Present values are kept.
    pub fn fill_missing(&mut self, other: &UserRecord) {
        fill(&mut self.display_name, &other.display_name);
        fill(&mut self.handle, &other.handle);
        fill(&mut self.bio, &other.bio);
        fill(&mut self.profile_image_url, &other.profile_image_url);
        fill(&mut self.profile_banner_url, &other.profile_banner_url);
        fill(&mut self.follower_count, &other.follower_count);
        fill(&mut self.following_count, &other.following_count);
        fill(&mut self.verified, &other.verified);
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, candidate: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(candidate);
    }
}

/// Post fields written to the graph. Write-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub external_id: String,
    pub created_at: DateTime<FixedOffset>,
    pub message: String,
    pub urls: Vec<String>,
    /// Deduplicated, first-seen order, case-sensitive.
    pub hashtags: Vec<String>,
    pub is_retweet: bool,
}

/// A normalized post with its author and mentions, ready for identity resolution.
///
/// `mentions` keeps every occurrence from the source, repeats included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub post: PostRecord,
    pub author: UserRecord,
    pub mentions: Vec<UserRecord>,
}
