//! Paths and child keys.
//!
//! Keys order the way the server orders them: keys that parse as 32-bit
//! non-negative integers sort numerically before every string key; string
//! keys sort lexicographically. Two sentinel names bracket the whole key
//! space so range filters can express open ends.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{invalid_argument, DatabaseResult};

/// Sentinel sorting before every real key.
pub const MIN_KEY_NAME: &str = "[MIN_NAME]";
/// Sentinel sorting after every real key.
pub const MAX_KEY_NAME: &str = "[MAX_NAME]";

const INVALID_KEY_CHARS: [char; 7] = ['.', '#', '$', '[', ']', '/', '\u{0}'];

/// A single path segment.
///
/// User-supplied keys are validated; meta keys (`.info` children and the
/// sentinels) are created through the trusted constructors only.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChildKey(String);

impl ChildKey {
    pub fn new(key: impl Into<String>) -> DatabaseResult<Self> {
        let key = key.into();
        validate_key(&key)?;
        Ok(Self(key))
    }

    /// Builds a key without validation. Reserved for protocol-level segments
    /// (`.info`, sentinel names) and data already accepted by the server.
    pub(crate) fn from_trusted(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub(crate) fn min() -> Self {
        Self(MIN_KEY_NAME.to_string())
    }

    pub(crate) fn max() -> Self {
        Self(MAX_KEY_NAME.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn as_int(&self) -> Option<u32> {
        // Leading '+' or values beyond 32 bits keep string ordering, matching
        // the server's key grammar.
        if self.0.is_empty() || (self.0.len() > 1 && self.0.starts_with('0')) {
            return if self.0 == "0" { Some(0) } else { None };
        }
        if !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.0.parse::<u32>().ok()
    }
}

impl fmt::Display for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialOrd for ChildKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChildKey {
    fn cmp(&self, other: &Self) -> Ordering {
        key_compare(self, other)
    }
}

/// Server key order, sentinels included.
pub fn key_compare(a: &ChildKey, b: &ChildKey) -> Ordering {
    if a.0 == b.0 {
        return Ordering::Equal;
    }
    match (a.0.as_str(), b.0.as_str()) {
        (MIN_KEY_NAME, _) | (_, MAX_KEY_NAME) => Ordering::Less,
        (MAX_KEY_NAME, _) | (_, MIN_KEY_NAME) => Ordering::Greater,
        _ => match (a.as_int(), b.as_int()) {
            (Some(left), Some(right)) => left
                .cmp(&right)
                .then_with(|| a.0.len().cmp(&b.0.len())),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.0.cmp(&b.0),
        },
    }
}

fn validate_key(key: &str) -> DatabaseResult<()> {
    if key.is_empty() {
        return Err(invalid_argument("Database keys must be non-empty strings"));
    }
    if matches!(key, ".key" | ".value" | ".priority" | ".sv") {
        return Err(invalid_argument(format!(
            "'{key}' is a reserved name and cannot be used as a key"
        )));
    }
    if let Some(bad) = key.chars().find(|ch| INVALID_KEY_CHARS.contains(ch)) {
        return Err(invalid_argument(format!(
            "Database keys cannot contain '{bad}' (offending key: '{key}')"
        )));
    }
    Ok(())
}

/// The smallest key that sorts strictly after `key`.
///
/// Integer keys step numerically; the largest integer key rolls over to the
/// smallest string key; string keys append the lowest push character.
pub(crate) fn successor_key(key: &ChildKey) -> ChildKey {
    const MIN_PUSH_CHAR: char = '-';
    if key.as_str() == u32::MAX.to_string() {
        return ChildKey::from_trusted(MIN_PUSH_CHAR.to_string());
    }
    match key.as_int() {
        Some(n) => ChildKey::from_trusted((n + 1).to_string()),
        None => ChildKey::from_trusted(format!("{}{}", key.as_str(), MIN_PUSH_CHAR)),
    }
}

/// The largest key that sorts strictly before `key`; the minimum sentinel
/// when none exists.
pub(crate) fn predecessor_key(key: &ChildKey) -> ChildKey {
    const MIN_PUSH_CHAR: char = '-';
    const MAX_PUSH_CHAR: char = 'z';
    if key.as_str() == "0" {
        return ChildKey::min();
    }
    match key.as_int() {
        Some(n) => ChildKey::from_trusted((n - 1).to_string()),
        None => {
            let text = key.as_str();
            let mut chars: Vec<char> = text.chars().collect();
            let last = *chars.last().expect("keys are non-empty");
            if last == MIN_PUSH_CHAR {
                chars.pop();
                ChildKey::from_trusted(chars.into_iter().collect::<String>())
            } else {
                let stepped = char::from_u32(last as u32 - 1).unwrap_or(MIN_PUSH_CHAR);
                chars.pop();
                let mut out: String = chars.into_iter().collect();
                out.push(stepped);
                out.push(MAX_PUSH_CHAR);
                ChildKey::from_trusted(out)
            }
        }
    }
}

/// An ordered sequence of child keys addressing a location in the tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Path {
    segments: Vec<ChildKey>,
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a slash-separated path, validating every segment.
    pub fn parse(raw: &str) -> DatabaseResult<Self> {
        let mut segments = Vec::new();
        for segment in raw.split('/') {
            if segment.is_empty() {
                continue;
            }
            // `.info` heads a client-side meta path and skips key validation.
            if segments.is_empty() && segment == ".info" {
                segments.push(ChildKey::from_trusted(segment));
            } else {
                segments.push(ChildKey::new(segment)?);
            }
        }
        Ok(Self { segments })
    }

    /// Builds a path from segments the server (or engine) already vouched for.
    pub(crate) fn from_trusted(raw: &str) -> Self {
        let segments = raw
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(ChildKey::from_trusted)
            .collect();
        Self { segments }
    }

    pub fn from_segments(segments: Vec<ChildKey>) -> Self {
        Self { segments }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn front(&self) -> Option<&ChildKey> {
        self.segments.first()
    }

    pub fn back(&self) -> Option<&ChildKey> {
        self.segments.last()
    }

    pub fn segments(&self) -> &[ChildKey] {
        &self.segments
    }

    /// The path without its first segment; root stays root.
    pub fn pop_front(&self) -> Path {
        let segments = self.segments.iter().skip(1).cloned().collect();
        Path { segments }
    }

    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            return None;
        }
        let segments = self.segments[..self.segments.len() - 1].to_vec();
        Some(Path { segments })
    }

    pub fn child(&self, key: ChildKey) -> Path {
        let mut segments = self.segments.clone();
        segments.push(key);
        Path { segments }
    }

    pub fn join(&self, other: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Path { segments }
    }

    /// Whether `self` is `other` or one of its ancestors.
    pub fn contains(&self, other: &Path) -> bool {
        if self.segments.len() > other.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| a == b)
    }

    /// `other` relative to `self`; `None` when `self` does not contain it.
    pub fn relative(&self, other: &Path) -> Option<Path> {
        if !self.contains(other) {
            return None;
        }
        let segments = other.segments[self.segments.len()..].to_vec();
        Some(Path { segments })
    }

    /// Whether either path contains the other.
    pub fn overlaps(&self, other: &Path) -> bool {
        self.contains(other) || other.contains(self)
    }

    pub fn is_info_path(&self) -> bool {
        self.front().map(|key| key.as_str() == ".info").unwrap_or(false)
    }

    /// Wire form: `/` for root, `/a/b` otherwise.
    pub fn to_wire(&self) -> String {
        if self.segments.is_empty() {
            "/".to_string()
        } else {
            let joined = self
                .segments
                .iter()
                .map(ChildKey::as_str)
                .collect::<Vec<_>>()
                .join("/");
            format!("/{joined}")
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ChildKey {
        ChildKey::new(name).unwrap()
    }

    #[test]
    fn integer_keys_sort_before_string_keys() {
        let mut keys = vec![key("banana"), key("10"), key("2"), key("apple"), key("0")];
        keys.sort();
        let names: Vec<&str> = keys.iter().map(ChildKey::as_str).collect();
        assert_eq!(names, vec!["0", "2", "10", "apple", "banana"]);
    }

    #[test]
    fn leading_zero_keys_compare_as_strings() {
        // "1" parses as an integer; keys with leading zeros do not, so they
        // sort after every integer key and lexicographically among strings.
        assert_eq!(key_compare(&key("1"), &key("01")), Ordering::Less);
        assert_eq!(key_compare(&key("001"), &key("01")), Ordering::Less);
        assert_eq!(key_compare(&key("01"), &key("001")), Ordering::Greater);
    }

    #[test]
    fn sentinels_bracket_all_keys() {
        let min = ChildKey::min();
        let max = ChildKey::max();
        assert_eq!(key_compare(&min, &key("0")), Ordering::Less);
        assert_eq!(key_compare(&key("zzz"), &max), Ordering::Less);
        assert_eq!(key_compare(&min, &max), Ordering::Less);
    }

    #[test]
    fn rejects_reserved_and_invalid_keys() {
        assert!(ChildKey::new(".priority").is_err());
        assert!(ChildKey::new(".sv").is_err());
        assert!(ChildKey::new("a#b").is_err());
        assert!(ChildKey::new("a[0]").is_err());
        assert!(ChildKey::new("").is_err());
        assert!(ChildKey::new("plain_key-1").is_ok());
    }

    #[test]
    fn parse_skips_empty_segments() {
        let path = Path::parse("/users//alice/").unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path.to_wire(), "/users/alice");
        assert_eq!(Path::parse("///").unwrap(), Path::root());
    }

    #[test]
    fn info_head_is_allowed_only_at_front() {
        assert!(Path::parse("/.info/connected").unwrap().is_info_path());
        assert!(Path::parse("/users/.info").is_err());
    }

    #[test]
    fn successor_and_predecessor_step_the_key_order() {
        assert_eq!(successor_key(&key("4")).as_str(), "5");
        assert_eq!(successor_key(&key("abc")).as_str(), "abc-");
        assert_eq!(predecessor_key(&key("5")).as_str(), "4");
        assert_eq!(predecessor_key(&key("0")).as_str(), MIN_KEY_NAME);
        assert_eq!(predecessor_key(&key("abc-")).as_str(), "abc");

        for name in ["4", "abc", "zeta"] {
            let base = key(name);
            assert_eq!(key_compare(&base, &successor_key(&base)), Ordering::Less);
            assert_eq!(
                key_compare(&predecessor_key(&base), &base),
                Ordering::Less
            );
        }
    }

    #[test]
    fn contains_and_relative() {
        let base = Path::parse("/users").unwrap();
        let deep = Path::parse("/users/alice/age").unwrap();
        assert!(base.contains(&deep));
        assert!(!deep.contains(&base));
        assert_eq!(
            base.relative(&deep).unwrap(),
            Path::parse("alice/age").unwrap()
        );
        assert!(base.overlaps(&deep));
        assert!(!Path::parse("/a").unwrap().overlaps(&Path::parse("/b").unwrap()));
    }
}
