//! Identity resolution for one canonical record.
//!
//! `build_upsert_plan` never talks to the backend. It assigns transaction-scoped
//! placeholders: one for the post, one per distinct user external id. The backend
//! binds each placeholder to the matching node if it exists or to a freshly created
//! one, inside the same transaction that writes the post, so there is no window
//! between "does it exist" and "create it" for a concurrent writer to slip into.

use std::collections::HashMap;
use std::fmt;

use streamgraph_common::{CanonicalRecord, PostRecord, UserRecord};

/// Transaction-scoped symbolic name for a node (`post`, `user_1`, `user_2`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Placeholder(String);

impl Placeholder {
    pub fn post() -> Self {
        Placeholder("post".to_string())
    }

    /// Users are numbered from 1 in first-seen order.
    pub fn user(n: usize) -> Self {
        Placeholder(format!("user_{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// One distinct user of the record and the placeholder bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSlot {
    pub placeholder: Placeholder,
    /// Attributes merged from every occurrence of this external id in the record.
    pub user: UserRecord,
}

/// A find-or-create request for one post, consumed by a `GraphBackend`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertPlan {
    pub post_ref: Placeholder,
    pub post: PostRecord,
    /// Distinct users, author first, then mentions in first-seen order.
    pub users: Vec<UserSlot>,
    pub author: Placeholder,
    /// One entry per mention occurrence; repeats share a placeholder.
    pub mentions: Vec<Placeholder>,
}

impl UpsertPlan {
    /// The user bound to `placeholder`, if any.
    pub fn user(&self, placeholder: &Placeholder) -> Option<&UserRecord> {
        self.users
            .iter()
            .find(|slot| &slot.placeholder == placeholder)
            .map(|slot| &slot.user)
    }

    /// External ids of every distinct user in the plan.
    pub fn user_keys(&self) -> impl Iterator<Item = &str> {
        self.users.iter().map(|slot| slot.user.external_id.as_str())
    }
}

/// Build the upsert plan for a normalized record.
pub fn build_upsert_plan(record: &CanonicalRecord) -> UpsertPlan {
    let mut users: Vec<UserSlot> = Vec::with_capacity(record.mentions.len() + 1);
    let mut by_key: HashMap<String, usize> = HashMap::new();

    let mut bind = |user: &UserRecord| -> Placeholder {
        if let Some(&idx) = by_key.get(&user.external_id) {
            users[idx].user.fill_missing(user);
            return users[idx].placeholder.clone();
        }
        let placeholder = Placeholder::user(users.len() + 1);
        by_key.insert(user.external_id.clone(), users.len());
        users.push(UserSlot {
            placeholder: placeholder.clone(),
            user: user.clone(),
        });
        placeholder
    };

    let author = bind(&record.author);
    let mentions = record.mentions.iter().map(&mut bind).collect();

    UpsertPlan {
        post_ref: Placeholder::post(),
        post: record.post.clone(),
        users,
        author,
        mentions,
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    fn post(id: &str) -> PostRecord {
        PostRecord {
            external_id: id.to_string(),
            created_at: DateTime::parse_from_rfc3339("2018-10-10T20:19:24+00:00").unwrap(),
            message: "hello".into(),
            urls: vec![],
            hashtags: vec![],
            is_retweet: false,
        }
    }

    fn record(author: &str, mentions: &[&str]) -> CanonicalRecord {
        CanonicalRecord {
            post: post("p1"),
            author: UserRecord::with_id(author),
            mentions: mentions.iter().map(|m| UserRecord::with_id(*m)).collect(),
        }
    }

    #[test]
    fn repeated_mentions_collapse_onto_one_placeholder() {
        let plan = build_upsert_plan(&record("u1", &["u2", "u2", "u2"]));
        assert_eq!(plan.users.len(), 2);
        assert_eq!(plan.mentions.len(), 3);
        assert!(plan.mentions.iter().all(|m| m == &Placeholder::user(2)));
    }

    #[test]
    fn author_mentioning_self_shares_author_placeholder() {
        let plan = build_upsert_plan(&record("u1", &["u3", "u1"]));
        assert_eq!(plan.author, Placeholder::user(1));
        assert_eq!(plan.mentions, vec![Placeholder::user(2), Placeholder::user(1)]);
        assert_eq!(plan.users.len(), 2);
    }

    #[test]
    fn distinct_users_are_numbered_in_first_seen_order() {
        let plan = build_upsert_plan(&record("a", &["b", "c", "b"]));
        let keys: Vec<&str> = plan.user_keys().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(plan.post_ref, Placeholder::post());
    }

    #[test]
    fn repeated_user_merges_attributes_without_overwriting() {
        let mut rec = record("a", &["a"]);
        rec.author.display_name = Some("Author".into());
        rec.mentions[0].display_name = Some("Mention Name".into());
        rec.mentions[0].handle = Some("a_handle".into());
        let plan = build_upsert_plan(&rec);
        let user = plan.user(&plan.author).unwrap();
        assert_eq!(user.display_name.as_deref(), Some("Author"));
        assert_eq!(user.handle.as_deref(), Some("a_handle"));
    }

    #[test]
    fn post_without_mentions_has_single_user() {
        let plan = build_upsert_plan(&record("solo", &[]));
        assert_eq!(plan.users.len(), 1);
        assert!(plan.mentions.is_empty());
    }

    #[test]
    fn placeholder_displays_as_variable() {
        assert_eq!(Placeholder::user(3).to_string(), "$user_3");
    }
}
