//! Virtual path parsing and containment checks.
//!
//! A [`VirtualPath`] is a cleaned, root-relative sequence of segments. It can
//! only be built through [`VirtualPath::parse`] (or by joining already valid
//! paths), so holding one means the lexical checks have passed. The
//! [`PathResolver`] then maps it onto the storage root and checks the
//! canonical result is still inside the root.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use super::is_internal_name;

/// Errors produced while validating or resolving a path.
#[derive(Debug, Error)]
pub enum PathError {
    /// The candidate contains a NUL character.
    #[error("path contains a NUL character")]
    NulByte,

    /// The candidate starts with a separator or a drive prefix.
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),

    /// A segment is `.` or `..`.
    #[error("path traversal detected: {0}")]
    Traversal(String),

    /// A segment names an internal staging or trash entry.
    #[error("reserved name: {0}")]
    Reserved(String),

    /// A single name was expected but the candidate has several segments.
    #[error("not a single path segment: {0}")]
    NotASegment(String),

    /// The canonical form of the path lies outside the storage root.
    #[error("path is outside the storage root: {0}")]
    OutsideRoot(String),

    /// The storage root cannot be used.
    #[error("storage root {path} is unusable: {source}")]
    Root {
        /// Configured root.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// IO error while inspecting the path.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A validated, root-relative path.
///
/// The empty path is the storage root itself. Ordering is by segment
/// sequence, which gives parents before children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath {
    segments: Vec<String>,
}

impl VirtualPath {
    /// The storage root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse an untrusted candidate.
    ///
    /// `\` is accepted as a separator and empty segments are dropped, but
    /// `.` and `..` segments, NUL bytes, leading separators, drive prefixes
    /// and internal names are rejected outright.
    pub fn parse(candidate: &str) -> Result<Self, PathError> {
        if candidate.contains('\0') {
            return Err(PathError::NulByte);
        }

        let normalized = candidate.replace('\\', "/");
        if normalized.starts_with('/') || has_drive_prefix(&normalized) {
            return Err(PathError::Absolute(candidate.to_string()));
        }

        let mut segments = Vec::new();
        for segment in normalized.split('/') {
            match segment {
                "" => continue,
                "." | ".." => return Err(PathError::Traversal(candidate.to_string())),
                s if is_internal_name(s) => return Err(PathError::Reserved(s.to_string())),
                s => segments.push(s.to_string()),
            }
        }

        Ok(Self { segments })
    }

    /// Parse a candidate that must be exactly one segment.
    pub fn segment(name: &str) -> Result<Self, PathError> {
        let path = Self::parse(name)?;
        if path.depth() != 1 {
            return Err(PathError::NotASegment(name.to_string()));
        }
        Ok(path)
    }

    /// Segments from the root down.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments; zero for the root.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Whether this is the storage root.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Containing directory, `None` for the root.
    pub fn parent(&self) -> Option<VirtualPath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Append another path.
    pub fn join(&self, other: &VirtualPath) -> VirtualPath {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Whether `self` equals `other` or lies beneath it.
    pub fn starts_with(&self, other: &VirtualPath) -> bool {
        self.segments.starts_with(&other.segments)
    }

    /// All proper, non-root prefixes, shallowest first.
    ///
    /// `a/b/c.txt` yields `a` and `a/b`.
    pub fn ancestors(&self) -> Vec<VirtualPath> {
        (1..self.segments.len())
            .map(|n| Self {
                segments: self.segments[..n].to_vec(),
            })
            .collect()
    }

    /// Relative filesystem form, joined with the platform separator.
    pub fn to_relative_path(&self) -> PathBuf {
        self.segments.iter().collect()
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl FromStr for VirtualPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// `C:` alone or followed by a separator. On Windows any `C:` prefix is
/// drive-relative, so `C:name` counts too.
fn has_drive_prefix(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    if bytes.len() < 2 || !bytes[0].is_ascii_alphabetic() || bytes[1] != b':' {
        return false;
    }
    cfg!(windows) || bytes.len() == 2 || bytes[2] == b'/'
}

/// Maps virtual paths onto the storage root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Create a resolver for an existing root directory.
    ///
    /// The root is canonicalized once here; all containment checks compare
    /// against this canonical form.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PathError> {
        let path = root.as_ref();
        let canonical = std::fs::canonicalize(path).map_err(|source| PathError::Root {
            path: path.to_path_buf(),
            source,
        })?;
        if !canonical.is_dir() {
            return Err(PathError::Root {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
            });
        }
        Ok(Self { root: canonical })
    }

    /// Canonical storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parse and resolve an untrusted candidate in one step.
    pub async fn resolve_str(&self, candidate: &str) -> Result<PathBuf, PathError> {
        let path = VirtualPath::parse(candidate)?;
        self.resolve(&path).await
    }

    /// Resolve a virtual path to an absolute path inside the root.
    ///
    /// The deepest existing prefix is canonicalized, which follows any
    /// symlinks in it, and the not-yet-existing remainder is appended. The
    /// result must equal the root or lie beneath it. A dangling symlink
    /// along the way is rejected since its target cannot be checked.
    pub async fn resolve(&self, path: &VirtualPath) -> Result<PathBuf, PathError> {
        let segments = path.segments();

        for existing in (0..=segments.len()).rev() {
            let mut prefix = self.root.clone();
            prefix.extend(&segments[..existing]);

            match tokio::fs::canonicalize(&prefix).await {
                Ok(mut resolved) => {
                    resolved.extend(&segments[existing..]);
                    return self.check_contained(path, resolved);
                }
                Err(e) if is_missing(&e) => {
                    if tokio::fs::symlink_metadata(&prefix).await.is_ok() {
                        debug!(path = %path, "Dangling symlink in path");
                        return Err(PathError::OutsideRoot(path.to_string()));
                    }
                }
                Err(e) if existing == 0 => {
                    return Err(PathError::Root {
                        path: self.root.clone(),
                        source: e,
                    });
                }
                Err(e) => return Err(PathError::Io(e)),
            }
        }

        Err(PathError::Root {
            path: self.root.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "storage root disappeared"),
        })
    }

    fn check_contained(&self, path: &VirtualPath, resolved: PathBuf) -> Result<PathBuf, PathError> {
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            debug!(path = %path, resolved = ?resolved, "Path resolves outside storage root");
            Err(PathError::OutsideRoot(path.to_string()))
        }
    }
}

fn is_missing(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(s: &str) -> Result<VirtualPath, PathError> {
        VirtualPath::parse(s)
    }

    #[test]
    fn test_parse_simple() {
        let path = parse("photos/2024/trip.jpg").unwrap();
        assert_eq!(path.segments(), ["photos", "2024", "trip.jpg"]);
        assert_eq!(path.depth(), 3);
        assert_eq!(path.file_name(), Some("trip.jpg"));
        assert_eq!(path.to_string(), "photos/2024/trip.jpg");
    }

    #[test]
    fn test_parse_normalizes_backslashes_and_empty_segments() {
        let path = parse("a\\b//c/").unwrap();
        assert_eq!(path.to_string(), "a/b/c");
    }

    #[test]
    fn test_parse_empty_is_root() {
        assert!(parse("").unwrap().is_root());
        assert!(VirtualPath::root().parent().is_none());
    }

    #[test]
    fn test_parse_rejects_traversal() {
        for candidate in [
            "..",
            ".",
            "../x",
            "a/../../b",
            "a\\..\\..\\b",
            "a/./b",
            "a/b/..",
            "../../etc/passwder",
        ] {
            assert!(
                matches!(parse(candidate), Err(PathError::Traversal(_))),
                "accepted {candidate}"
            );
        }
    }

    #[test]
    fn test_parse_rejects_absolute() {
        for candidate in ["/etc/passwd", "\\windows", "C:\\x", "c:/x", "C:", "//server/share"] {
            assert!(
                matches!(parse(candidate), Err(PathError::Absolute(_))),
                "accepted {candidate}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_accepts_colon_names() {
        assert_eq!(parse("a:notes.txt").unwrap().to_string(), "a:notes.txt");
        assert_eq!(parse("x:y/z.txt").unwrap().depth(), 2);
        assert!(VirtualPath::segment("b:c").is_ok());
    }

    #[test]
    fn test_parse_rejects_nul_and_reserved() {
        assert!(matches!(parse("a\0b"), Err(PathError::NulByte)));
        assert!(matches!(
            parse("a/.cloudshelf-00ff.part"),
            Err(PathError::Reserved(_))
        ));
    }

    #[test]
    fn test_parse_keeps_dots_inside_names() {
        let path = parse("a..b/...").unwrap();
        assert_eq!(path.segments(), ["a..b", "..."]);
    }

    #[test]
    fn test_segment_requires_single_name() {
        assert!(VirtualPath::segment("x.txt").is_ok());
        assert!(matches!(
            VirtualPath::segment("a/x.txt"),
            Err(PathError::NotASegment(_))
        ));
        assert!(matches!(VirtualPath::segment(""), Err(PathError::NotASegment(_))));
    }

    #[test]
    fn test_ancestors_and_parent() {
        let path = parse("a/b/c.txt").unwrap();
        let ancestors: Vec<String> = path.ancestors().iter().map(ToString::to_string).collect();
        assert_eq!(ancestors, ["a", "a/b"]);
        assert_eq!(path.parent().unwrap().to_string(), "a/b");
        assert!(parse("x").unwrap().ancestors().is_empty());
        assert!(parse("x").unwrap().parent().unwrap().is_root());
    }

    #[test]
    fn test_join_and_starts_with() {
        let base = parse("a").unwrap();
        let joined = base.join(&parse("b/c").unwrap());
        assert_eq!(joined.to_string(), "a/b/c");
        assert!(joined.starts_with(&base));
        assert!(joined.starts_with(&VirtualPath::root()));
        assert!(!base.starts_with(&joined));
        assert!(!parse("ab").unwrap().starts_with(&base));
    }

    #[tokio::test]
    async fn test_resolve_existing_and_missing() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("a")).unwrap();
        let resolver = PathResolver::new(temp_dir.path()).unwrap();

        let existing = resolver.resolve_str("a").await.unwrap();
        assert_eq!(existing, resolver.root().join("a"));

        let missing = resolver.resolve_str("a/new/deep.txt").await.unwrap();
        assert_eq!(missing, resolver.root().join("a/new/deep.txt"));

        let root = resolver.resolve(&VirtualPath::root()).await.unwrap();
        assert_eq!(root, resolver.root());
    }

    #[tokio::test]
    async fn test_resolved_paths_lie_physically_under_root() {
        let temp_dir = TempDir::new().unwrap();
        let resolver = PathResolver::new(temp_dir.path()).unwrap();

        for candidate in ["x.txt", "a/b/c.txt", "a\\d.txt", "deep/er/still/f"] {
            let resolved = resolver.resolve_str(candidate).await.unwrap();
            std::fs::create_dir_all(resolved.parent().unwrap()).unwrap();
            std::fs::write(&resolved, b"x").unwrap();
            let canonical = std::fs::canonicalize(&resolved).unwrap();
            assert!(canonical.starts_with(resolver.root()), "{candidate} escaped");
        }
    }

    #[tokio::test]
    async fn test_resolve_through_file_component() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("file"), b"x").unwrap();
        let resolver = PathResolver::new(temp_dir.path()).unwrap();

        // Lexically inside the root; creating it will fail later, but it is
        // not an escape.
        let resolved = resolver.resolve_str("file/child").await.unwrap();
        assert!(resolved.starts_with(resolver.root()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_rejects_symlink_escape() {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("link")).unwrap();
        let resolver = PathResolver::new(temp_dir.path()).unwrap();

        assert!(matches!(
            resolver.resolve_str("link").await,
            Err(PathError::OutsideRoot(_))
        ));
        assert!(matches!(
            resolver.resolve_str("link/new.txt").await,
            Err(PathError::OutsideRoot(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_allows_symlink_within_root() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(
            temp_dir.path().join("real"),
            temp_dir.path().join("alias"),
        )
        .unwrap();
        let resolver = PathResolver::new(temp_dir.path()).unwrap();

        let resolved = resolver.resolve_str("alias/x.txt").await.unwrap();
        assert_eq!(resolved, resolver.root().join("real/x.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_rejects_dangling_symlink() {
        let temp_dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/nonexistent/cloudshelf", temp_dir.path().join("dangling"))
            .unwrap();
        let resolver = PathResolver::new(temp_dir.path()).unwrap();

        assert!(matches!(
            resolver.resolve_str("dangling/x").await,
            Err(PathError::OutsideRoot(_))
        ));
    }

    #[test]
    fn test_resolver_requires_existing_root() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");
        assert!(matches!(
            PathResolver::new(&missing),
            Err(PathError::Root { .. })
        ));
    }
}
