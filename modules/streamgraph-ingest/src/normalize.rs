//! Raw stream message → canonical record.
//!
//! Pure and deterministic. A failure here is permanent for that input: the
//! record is counted and dropped, never retried.

use chrono::{DateTime, FixedOffset};
use thiserror::Error;

use streamgraph_common::{
    CanonicalRecord, PostRecord, RawMention, RawPost, RawUser, StreamMessage, UserRecord,
};

/// Creation time layout used by the upstream API, e.g. `Wed Oct 10 20:19:24 +0000 2018`.
pub const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    /// Keep-alive, delete notice, or any other non-post message.
    #[error("message is not a post")]
    NotAPost,

    /// Post-shaped, but a field has the wrong type.
    #[error("malformed post: {0}")]
    MalformedPost(String),

    #[error("malformed created_at {value}: {reason}")]
    MalformedTimestamp { value: String, reason: String },
}

pub fn normalize(message: &StreamMessage) -> Result<CanonicalRecord, NormalizeError> {
    match message {
        StreamMessage::Post(post) => normalize_post(post),
        StreamMessage::Malformed { reason, .. } => Err(NormalizeError::MalformedPost(reason.clone())),
        StreamMessage::Other(_) => Err(NormalizeError::NotAPost),
    }
}

pub fn normalize_post(raw: &RawPost) -> Result<CanonicalRecord, NormalizeError> {
    if raw.id_str.is_empty() || raw.user.id_str.is_empty() {
        return Err(NormalizeError::NotAPost);
    }

    let created_at = match raw.created_at.as_str() {
        Some(value) => parse_created_at(value)?,
        None => {
            return Err(NormalizeError::MalformedTimestamp {
                value: raw.created_at.to_string(),
                reason: "not a string".into(),
            })
        }
    };

    let message = raw
        .full_text
        .clone()
        .or_else(|| raw.extended_tweet.as_ref().and_then(|e| e.full_text.clone()))
        .unwrap_or_else(|| raw.text.clone());

    let urls = raw
        .entities
        .urls
        .iter()
        .filter_map(|u| non_empty(&u.expanded_url).or_else(|| non_empty(&u.url)))
        .collect();

    let mut hashtags: Vec<String> = Vec::new();
    for tag in &raw.entities.hashtags {
        if !tag.text.is_empty() && !hashtags.contains(&tag.text) {
            hashtags.push(tag.text.clone());
        }
    }

    Ok(CanonicalRecord {
        post: PostRecord {
            external_id: raw.id_str.clone(),
            created_at,
            message,
            urls,
            hashtags,
            is_retweet: raw.retweeted || raw.retweeted_status.is_some(),
        },
        author: author(&raw.user),
        mentions: raw
            .entities
            .user_mentions
            .iter()
            .filter(|m| !m.id_str.is_empty())
            .map(mention)
            .collect(),
    })
}

pub fn parse_created_at(value: &str) -> Result<DateTime<FixedOffset>, NormalizeError> {
    DateTime::parse_from_str(value, CREATED_AT_FORMAT).map_err(|e| {
        NormalizeError::MalformedTimestamp {
            value: format!("{value:?}"),
            reason: e.to_string(),
        }
    })
}

fn author(user: &RawUser) -> UserRecord {
    UserRecord {
        external_id: user.id_str.clone(),
        display_name: non_empty(&user.name),
        handle: non_empty(&user.screen_name),
        bio: non_empty(&user.description),
        profile_image_url: non_empty(&user.profile_image_url),
        profile_banner_url: non_empty(&user.profile_banner_url),
        follower_count: user.followers_count,
        following_count: user.friends_count,
        verified: user.verified,
    }
}

fn mention(m: &RawMention) -> UserRecord {
    UserRecord {
        display_name: non_empty(&m.name),
        handle: non_empty(&m.screen_name),
        ..UserRecord::with_id(m.id_str.clone())
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.trim().is_empty()).cloned()
}
