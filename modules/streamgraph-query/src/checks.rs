//! Shape checks on read-path results. Pure: each takes what a query returned
//! and the parameter it was run with.

use thiserror::Error;

use streamgraph_graph::{PostRow, RankedUser, UserRow};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error("empty result")]
    Empty,

    #[error("row {row}: expected {field} {expected:?}, found {found:?}")]
    Mismatch {
        row: usize,
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("row {row}: {field} is missing")]
    Missing { row: usize, field: &'static str },

    #[error("row {row}: count {count} ranks above {previous}")]
    Unordered { row: usize, previous: i64, count: i64 },
}

/// Every post carries `tag`.
pub fn posts_with_hashtag(tag: &str, posts: &[PostRow]) -> Result<(), CheckError> {
    if posts.is_empty() {
        return Err(CheckError::Empty);
    }
    for (row, post) in posts.iter().enumerate() {
        if !post.hashtags.iter().any(|h| h == tag) {
            return Err(CheckError::Mismatch {
                row,
                field: "hashtags",
                expected: tag.to_string(),
                found: post.hashtags.join(","),
            });
        }
    }
    Ok(())
}

/// Every user has `handle` and a non-empty external id.
pub fn users_with_handle(handle: &str, users: &[UserRow]) -> Result<(), CheckError> {
    if users.is_empty() {
        return Err(CheckError::Empty);
    }
    for (row, user) in users.iter().enumerate() {
        if user.external_id.is_empty() {
            return Err(CheckError::Missing { row, field: "external_id" });
        }
        if user.handle.as_deref() != Some(handle) {
            return Err(CheckError::Mismatch {
                row,
                field: "handle",
                expected: handle.to_string(),
                found: user.handle.clone().unwrap_or_default(),
            });
        }
    }
    Ok(())
}

/// Non-empty ids, positive counts, in descending order.
pub fn ranking(users: &[RankedUser]) -> Result<(), CheckError> {
    if users.is_empty() {
        return Err(CheckError::Empty);
    }
    let mut previous = i64::MAX;
    for (row, ranked) in users.iter().enumerate() {
        if ranked.user.external_id.is_empty() {
            return Err(CheckError::Missing { row, field: "external_id" });
        }
        if ranked.count <= 0 {
            return Err(CheckError::Missing { row, field: "count" });
        }
        if ranked.count > previous {
            return Err(CheckError::Unordered {
                row,
                previous,
                count: ranked.count,
            });
        }
        previous = ranked.count;
    }
    Ok(())
}

/// The user exists under `external_id` and has a handle.
pub fn user_by_id(external_id: &str, user: Option<&UserRow>) -> Result<(), CheckError> {
    let user = user.ok_or(CheckError::Empty)?;
    if user.external_id != external_id {
        return Err(CheckError::Mismatch {
            row: 0,
            field: "external_id",
            expected: external_id.to_string(),
            found: user.external_id.clone(),
        });
    }
    match user.handle.as_deref() {
        Some(h) if !h.is_empty() => Ok(()),
        _ => Err(CheckError::Missing { row: 0, field: "handle" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, handle: Option<&str>) -> UserRow {
        UserRow {
            graph_id: "1".into(),
            external_id: id.into(),
            handle: handle.map(str::to_string),
            display_name: None,
        }
    }

    fn post(tags: &[&str]) -> PostRow {
        PostRow {
            graph_id: "1".into(),
            external_id: "p".into(),
            created_at: None,
            message: String::new(),
            hashtags: tags.iter().map(|t| t.to_string()).collect(),
            is_retweet: false,
        }
    }

    fn ranked(id: &str, count: i64) -> RankedUser {
        RankedUser {
            user: user(id, Some("h")),
            count,
        }
    }

    #[test]
    fn hashtag_must_be_on_every_post() {
        assert!(posts_with_hashtag("rust", &[post(&["rust", "go"]), post(&["rust"])]).is_ok());
        assert!(matches!(
            posts_with_hashtag("rust", &[post(&["rust"]), post(&["Rust"])]),
            Err(CheckError::Mismatch { row: 1, .. })
        ));
        assert_eq!(posts_with_hashtag("rust", &[]), Err(CheckError::Empty));
    }

    #[test]
    fn handle_lookup_requires_exact_handle() {
        assert!(users_with_handle("amy", &[user("1", Some("amy"))]).is_ok());
        assert!(users_with_handle("amy", &[user("1", None)]).is_err());
        assert_eq!(
            users_with_handle("amy", &[user("", Some("amy"))]),
            Err(CheckError::Missing { row: 0, field: "external_id" })
        );
    }

    #[test]
    fn ranking_must_descend() {
        assert!(ranking(&[ranked("a", 5), ranked("b", 5), ranked("c", 1)]).is_ok());
        assert_eq!(
            ranking(&[ranked("a", 2), ranked("b", 3)]),
            Err(CheckError::Unordered { row: 1, previous: 2, count: 3 })
        );
        assert!(ranking(&[ranked("", 1)]).is_err());
    }

    #[test]
    fn user_lookup_checks_id_and_handle() {
        assert!(user_by_id("7", Some(&user("7", Some("seven")))).is_ok());
        assert!(user_by_id("7", Some(&user("8", Some("eight")))).is_err());
        assert!(user_by_id("7", Some(&user("7", None))).is_err());
        assert_eq!(user_by_id("7", None), Err(CheckError::Empty));
    }
}
