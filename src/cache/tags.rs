//! Tags and the tag → cache key index
//!
//! Query entries provide tags when they succeed, mutations invalidate tags
//! when they succeed. The index answers "which keys currently provide this
//! tag" with a two-level rule: a tag without an id matches every entry
//! providing that type, a tag with an id matches only that exact pair.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::cache::transport::TransportError;
use crate::cache::types::CacheKey;

/// Identifier part of a tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagId {
    Num(i64),
    Str(String),
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagId::Num(n) => write!(f, "{}", n),
            TagId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for TagId {
    fn from(n: i64) -> Self {
        TagId::Num(n)
    }
}

impl From<i32> for TagId {
    fn from(n: i32) -> Self {
        TagId::Num(n.into())
    }
}

impl From<&str> for TagId {
    fn from(s: &str) -> Self {
        TagId::Str(s.to_string())
    }
}

impl From<String> for TagId {
    fn from(s: String) -> Self {
        TagId::Str(s)
    }
}

/// Abstract `(type, id?)` label relating mutations to the queries they affect
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "type")]
    pub tag_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TagId>,
}

impl Tag {
    /// A tag covering every entry of the given type
    pub fn of_type(tag_type: impl Into<String>) -> Self {
        Self {
            tag_type: tag_type.into(),
            id: None,
        }
    }

    /// A tag for one specific `(type, id)` pair
    pub fn with_id(tag_type: impl Into<String>, id: impl Into<TagId>) -> Self {
        Self {
            tag_type: tag_type.into(),
            id: Some(id.into()),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.tag_type, id),
            None => write!(f, "{}", self.tag_type),
        }
    }
}

type TagsFn = dyn Fn(Option<&Value>, Option<&TransportError>, &Value) -> Vec<Tag> + Send + Sync;

/// Tags declared by an endpoint definition
#[derive(Clone, Default)]
pub enum TagDescription {
    #[default]
    Empty,
    /// A fixed tag list
    Static(Vec<Tag>),
    /// Tags computed from `(result, error, args)`
    Computed(Arc<TagsFn>),
}

impl TagDescription {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(Option<&Value>, Option<&TransportError>, &Value) -> Vec<Tag> + Send + Sync + 'static,
    {
        TagDescription::Computed(Arc::new(f))
    }

    /// Resolve the description to concrete tags
    pub fn resolve(
        &self,
        result: Option<&Value>,
        error: Option<&TransportError>,
        args: &Value,
    ) -> Vec<Tag> {
        match self {
            TagDescription::Empty => Vec::new(),
            TagDescription::Static(tags) => tags.clone(),
            TagDescription::Computed(f) => f(result, error, args),
        }
    }
}

impl fmt::Debug for TagDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagDescription::Empty => write!(f, "TagDescription::Empty"),
            TagDescription::Static(tags) => f.debug_tuple("TagDescription::Static").field(tags).finish(),
            TagDescription::Computed(_) => write!(f, "TagDescription::Computed(..)"),
        }
    }
}

impl From<Vec<Tag>> for TagDescription {
    fn from(tags: Vec<Tag>) -> Self {
        TagDescription::Static(tags)
    }
}

/// Index from provided tags to the cache keys providing them
///
/// Layout: tag type → (id, or none for type-level tags) → keys.
/// Serialized as a flat list of memberships.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<TagMembership>", into = "Vec<TagMembership>")]
pub struct TagIndex {
    by_type: HashMap<String, HashMap<Option<TagId>, HashSet<CacheKey>>>,
}

/// One tag and the keys currently providing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMembership {
    pub tag: Tag,
    pub keys: BTreeSet<CacheKey>,
}

impl From<TagIndex> for Vec<TagMembership> {
    fn from(index: TagIndex) -> Self {
        let mut memberships: Vec<TagMembership> = index
            .by_type
            .into_iter()
            .flat_map(|(tag_type, ids)| {
                ids.into_iter().map(move |(id, keys)| TagMembership {
                    tag: Tag {
                        tag_type: tag_type.clone(),
                        id,
                    },
                    keys: keys.into_iter().collect(),
                })
            })
            .collect();
        memberships.sort_by(|a, b| a.tag.cmp(&b.tag));
        memberships
    }
}

impl From<Vec<TagMembership>> for TagIndex {
    fn from(memberships: Vec<TagMembership>) -> Self {
        let mut index = TagIndex::default();
        for membership in memberships {
            index
                .by_type
                .entry(membership.tag.tag_type)
                .or_default()
                .entry(membership.tag.id)
                .or_default()
                .extend(membership.keys);
        }
        index
    }
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tags provided by `key`
    pub fn replace(&mut self, key: &CacheKey, old: &BTreeSet<Tag>, new: &BTreeSet<Tag>) {
        for tag in old.difference(new) {
            self.remove_one(key, tag);
        }
        for tag in new.difference(old) {
            self.by_type
                .entry(tag.tag_type.clone())
                .or_default()
                .entry(tag.id.clone())
                .or_default()
                .insert(key.clone());
        }
    }

    /// Drop every membership of `key`
    pub fn remove_key(&mut self, key: &CacheKey, provided: &BTreeSet<Tag>) {
        for tag in provided {
            self.remove_one(key, tag);
        }
    }

    fn remove_one(&mut self, key: &CacheKey, tag: &Tag) {
        if let Some(ids) = self.by_type.get_mut(&tag.tag_type) {
            if let Some(keys) = ids.get_mut(&tag.id) {
                keys.remove(key);
                if keys.is_empty() {
                    ids.remove(&tag.id);
                }
            }
            if ids.is_empty() {
                self.by_type.remove(&tag.tag_type);
            }
        }
    }

    /// Keys matched by a single invalidation tag
    pub fn matching(&self, tag: &Tag) -> BTreeSet<CacheKey> {
        let Some(ids) = self.by_type.get(&tag.tag_type) else {
            return BTreeSet::new();
        };
        match &tag.id {
            None => ids.values().flatten().cloned().collect(),
            Some(id) => ids
                .get(&Some(id.clone()))
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Union of the keys matched by all `tags`
    pub fn affected_keys<'a>(&self, tags: impl IntoIterator<Item = &'a Tag>) -> BTreeSet<CacheKey> {
        tags.into_iter().flat_map(|tag| self.matching(tag)).collect()
    }

    pub fn clear(&mut self) {
        self.by_type.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(list: &[Tag]) -> BTreeSet<Tag> {
        list.iter().cloned().collect()
    }

    #[test]
    fn test_wildcard_and_exact_matching() {
        let mut index = TagIndex::new();
        let post5 = CacheKey::from("getPost(5)");
        index.replace(&post5, &BTreeSet::new(), &tags(&[Tag::with_id("Post", 5)]));

        assert!(index.matching(&Tag::of_type("Post")).contains(&post5));
        assert!(index.matching(&Tag::with_id("Post", 5)).contains(&post5));
        assert!(index.matching(&Tag::with_id("Post", 7)).is_empty());
        assert!(index.matching(&Tag::of_type("Comment")).is_empty());
    }

    #[test]
    fn test_exact_tag_does_not_match_type_level_provider() {
        let mut index = TagIndex::new();
        let list = CacheKey::from("getPosts(null)");
        index.replace(&list, &BTreeSet::new(), &tags(&[Tag::of_type("Post")]));

        assert!(index.matching(&Tag::with_id("Post", 5)).is_empty());
        assert!(index.matching(&Tag::of_type("Post")).contains(&list));
    }

    #[test]
    fn test_replace_drops_stale_memberships() {
        let mut index = TagIndex::new();
        let key = CacheKey::from("getPost(5)");
        let old = tags(&[Tag::with_id("Post", 5), Tag::of_type("Feed")]);
        let new = tags(&[Tag::with_id("Post", 5)]);

        index.replace(&key, &BTreeSet::new(), &old);
        index.replace(&key, &old, &new);

        assert!(index.matching(&Tag::of_type("Feed")).is_empty());
        assert_eq!(index.matching(&Tag::of_type("Post")).len(), 1);

        index.remove_key(&key, &new);
        assert!(index.is_empty());
    }

    #[test]
    fn test_affected_keys_union() {
        let mut index = TagIndex::new();
        let a = CacheKey::from("a");
        let b = CacheKey::from("b");
        index.replace(&a, &BTreeSet::new(), &tags(&[Tag::with_id("Post", 1)]));
        index.replace(&b, &BTreeSet::new(), &tags(&[Tag::with_id("Comment", "x")]));

        let affected = index.affected_keys(&[Tag::with_id("Post", 1), Tag::of_type("Comment")]);
        assert_eq!(affected.len(), 2);
    }

    #[test]
    fn test_computed_description() {
        let description = TagDescription::computed(|result, _error, args| {
            let mut out = vec![Tag::with_id("Post", args.as_i64().unwrap_or_default())];
            if result.is_some() {
                out.push(Tag::of_type("Feed"));
            }
            out
        });

        let resolved = description.resolve(Some(&json!({})), None, &json!(9));
        assert_eq!(resolved, vec![Tag::with_id("Post", 9), Tag::of_type("Feed")]);
        assert!(TagDescription::Empty.resolve(None, None, &json!(1)).is_empty());
    }

    #[test]
    fn test_index_survives_serialization() {
        let mut index = TagIndex::new();
        let key = CacheKey::from("getPost(5)");
        index.replace(&key, &BTreeSet::new(), &tags(&[Tag::with_id("Post", 5)]));

        let json = serde_json::to_string(&index).unwrap();
        let restored: TagIndex = serde_json::from_str(&json).unwrap();
        assert!(restored.matching(&Tag::of_type("Post")).contains(&key));
    }

    #[test]
    fn test_tag_serialization_shape() {
        let value = serde_json::to_value(Tag::with_id("Post", 5)).unwrap();
        assert_eq!(value, json!({"type": "Post", "id": 5}));
        assert_eq!(Tag::of_type("Post").to_string(), "Post");
    }
}
