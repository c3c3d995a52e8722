use std::fmt;

/// Case-insensitive set of short tags that triggers attach to a request
/// and acting filters read back (`block`, `save`, `slow`, ...).
///
/// Insertion order is kept so the tags print in the order they were set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    tags: Vec<String>,
}

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a comma or space separated list
    pub fn parse(list: &str) -> Self {
        let mut flags = Self::new();
        flags.set(list);
        flags
    }

    pub fn contains(&self, tag: &str) -> bool {
        let tag = tag.trim();
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Add every tag in a comma or space separated list
    pub fn set(&mut self, list: &str) {
        for tag in list.split(|c: char| c == ',' || c.is_whitespace()) {
            self.insert(tag);
        }
    }

    /// Add one tag; empty tags are ignored
    pub fn insert(&mut self, tag: &str) {
        let tag = tag.trim().to_ascii_lowercase();
        if !tag.is_empty() && !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    pub fn clear_tag(&mut self, tag: &str) {
        let tag = tag.trim();
        self.tags.retain(|t| !t.eq_ignore_ascii_case(tag));
    }

    pub fn union(&mut self, other: &Flags) {
        for tag in &other.tags {
            self.insert(tag);
        }
    }

    /// True if any tag of the comma separated list is set
    pub fn any(&self, list: &str) -> bool {
        list.split(',').any(|tag| self.contains(tag))
    }

    /// True if every tag of the comma separated list is set
    pub fn all(&self, list: &str) -> bool {
        list.split(',')
            .filter(|tag| !tag.trim().is_empty())
            .all(|tag| self.contains(tag))
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tags.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_is_case_insensitive() {
        let mut flags = Flags::new();
        flags.set("Block, SAVE slow");
        assert!(flags.contains("block"));
        assert!(flags.contains("Save"));
        assert!(flags.contains("SLOW"));
        assert_eq!(flags.to_string(), "block,save,slow");
    }

    #[test]
    fn test_no_duplicates() {
        let mut flags = Flags::parse("block");
        flags.insert("BLOCK");
        flags.set("block,,  ");
        assert_eq!(flags.iter().count(), 1);
    }

    #[test]
    fn test_any_and_all() {
        let flags = Flags::parse("block,save");
        assert!(flags.any("slow,save"));
        assert!(!flags.any("slow,tamper"));
        assert!(flags.all("block,save"));
        assert!(!flags.all("block,slow"));
    }

    #[test]
    fn test_union_and_clear() {
        let mut a = Flags::parse("block");
        let b = Flags::parse("slow,block");
        a.union(&b);
        assert_eq!(a.to_string(), "block,slow");

        a.clear_tag("Block");
        assert!(!a.contains("block"));
        assert!(Flags::new().is_empty());
    }
}
