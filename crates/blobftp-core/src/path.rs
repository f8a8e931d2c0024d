//! Path splitting and root-anchored lookup queries.
//!
//! FTP paths arrive as slash-separated strings. The cache never stores
//! full paths; it stores `(parent, name)` pairs, so a lookup is a chain of
//! name constraints running from the target back to the root:
//!
//! ```text
//! /a/b/c.txt   node query      depth 0 = "c.txt", depth 1 = "b", depth 2 = "a"
//! /a/b         children query  depth 1 = "b",     depth 2 = "a"
//! ```
//!
//! The outermost filter must sit directly under the root, so `/b` never
//! matches a `b` that lives at `/a/b`.

/// Path separator used by the FTP front end and by object keys.
pub const SEPARATOR: char = '/';

/// Split a path into its non-empty segments.
///
/// Leading, trailing and repeated separators are ignored; `"/"` and `""`
/// both yield an empty vector (the root).
pub fn split_path(path: &str) -> Vec<String> {
    path.split(SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Join segments back into an absolute path (`/a/b`, or `/` for the root).
pub fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    if segments.is_empty() {
        return SEPARATOR.to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push(SEPARATOR);
        out.push_str(segment.as_ref());
    }
    out
}

/// Object key for a path on a prefix-addressed store (`a/b`, no leading slash).
pub fn object_key<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether `name` is usable as a single path segment.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(SEPARATOR)
}

/// What a [`PathQuery`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// The node named by the last segment.
    Node,
    /// The direct children of the node named by the last segment.
    Children,
}

/// A single name constraint in a lookup chain.
///
/// `depth` counts ancestors above the selected rows: 0 is the row itself,
/// 1 its parent, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameFilter<'a> {
    pub depth: usize,
    pub name: &'a str,
}

/// A root-anchored lookup predicate built from path segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathQuery {
    segments: Vec<String>,
    mode: QueryMode,
}

impl PathQuery {
    /// Query selecting the node at `segments`.
    pub fn node<S: AsRef<str>>(segments: &[S]) -> Self {
        Self::build(segments, QueryMode::Node)
    }

    /// Query selecting the direct children of the node at `segments`.
    pub fn children<S: AsRef<str>>(segments: &[S]) -> Self {
        Self::build(segments, QueryMode::Children)
    }

    fn build<S: AsRef<str>>(segments: &[S], mode: QueryMode) -> Self {
        Self {
            segments: segments.iter().map(|s| s.as_ref().to_owned()).collect(),
            mode,
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn mode(&self) -> QueryMode {
        self.mode
    }

    /// Name constraints from the innermost outward.
    ///
    /// In children mode the selected rows carry no name constraint, so the
    /// last segment constrains depth 1.
    pub fn filters(&self) -> impl DoubleEndedIterator<Item = NameFilter<'_>> + ExactSizeIterator {
        let offset = match self.mode {
            QueryMode::Node => 0,
            QueryMode::Children => 1,
        };
        self.segments
            .iter()
            .rev()
            .enumerate()
            .map(move |(i, name)| NameFilter {
                depth: i + offset,
                name,
            })
    }

    /// Depth of the outermost filter, whose row must be a child of the root.
    pub fn anchor_depth(&self) -> Option<usize> {
        self.filters().last().map(|f| f.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_path_strips_separators() {
        assert_eq!(split_path("/a/b/c.txt"), vec!["a", "b", "c.txt"]);
        assert_eq!(split_path("a/b/"), vec!["a", "b"]);
        assert_eq!(split_path("//a///b"), vec!["a", "b"]);
        assert!(split_path("/").is_empty());
        assert!(split_path("").is_empty());
    }

    #[test]
    fn test_join_and_key() {
        assert_eq!(join_path::<&str>(&[]), "/");
        assert_eq!(join_path(&["a", "b"]), "/a/b");
        assert_eq!(object_key(&["a", "b", "c.txt"]), "a/b/c.txt");
        assert_eq!(object_key::<&str>(&[]), "");
    }

    #[test]
    fn test_node_query_filters() {
        let query = PathQuery::node(&["a", "b", "c.txt"]);
        let filters: Vec<_> = query.filters().map(|f| (f.depth, f.name)).collect();
        assert_eq!(filters, vec![(0, "c.txt"), (1, "b"), (2, "a")]);
        assert_eq!(query.anchor_depth(), Some(2));
    }

    #[test]
    fn test_children_query_skips_final_name() {
        let query = PathQuery::children(&["a", "b"]);
        let filters: Vec<_> = query.filters().map(|f| (f.depth, f.name)).collect();
        assert_eq!(filters, vec![(1, "b"), (2, "a")]);

        let root = PathQuery::children::<&str>(&[]);
        assert_eq!(root.filters().count(), 0);
        assert_eq!(root.anchor_depth(), None);
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("report.csv"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name("a/b"));
    }

    proptest! {
        #[test]
        fn split_is_stable_under_rejoin(path in "[a-z/]{0,40}") {
            let segments = split_path(&path);
            prop_assert!(segments.iter().all(|s| !s.is_empty() && !s.contains('/')));
            prop_assert_eq!(split_path(&join_path(&segments)), segments);
        }
    }
}
