use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::ObjectStoreError;

/// Physical bucket or directory name for a logical namespace.
pub fn physical_name(prefix: &str, namespace: &str) -> String {
    format!("{prefix}-{namespace}")
}

/// Ordered, non-empty sequence of non-empty segments addressing an object
/// within a namespace, e.g. `["images", "42", "0.png"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath {
    segments: Vec<String>,
}

impl ObjectPath {
    pub fn new<I, S>(segments: I) -> Result<Self, ObjectStoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();

        if segments.is_empty() {
            return Err(ObjectStoreError::InvalidPath(
                "path must have at least one segment".to_string(),
            ));
        }
        if let Some(index) = segments.iter().position(|s| s.is_empty()) {
            return Err(ObjectStoreError::InvalidPath(format!(
                "segment {index} of '{}' is empty",
                segments.join("/")
            )));
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Remote object key: segments joined with `/`, no leading separator.
    pub fn to_key(&self) -> String {
        self.segments.join("/")
    }

    /// File path under `base` with one component per segment.
    ///
    /// Segments that would resolve outside `base` (`.`, `..`, or anything
    /// containing a separator) are rejected.
    pub fn to_local_path(&self, base: &Path) -> Result<PathBuf, ObjectStoreError> {
        let mut path = base.to_path_buf();
        for segment in &self.segments {
            if segment == "." || segment == ".." || segment.contains(['/', '\\']) {
                return Err(ObjectStoreError::InvalidPath(format!(
                    "segment '{segment}' of '{self}' is not a plain file name"
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

/// Parses a `/`-separated key such as `images/42/0.png`.
impl FromStr for ObjectPath {
    type Err = ObjectStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.split('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_name_prefixes_namespace() {
        assert_eq!(physical_name("unit-test", "images"), "unit-test-images");
        assert_eq!(
            physical_name("foobar", "org.foo.bar.images"),
            "foobar-org.foo.bar.images"
        );
    }

    #[test]
    fn test_key_joins_with_slash() {
        let path = ObjectPath::new(["images", "42", "0.png"]).unwrap();
        assert_eq!(path.to_key(), "images/42/0.png");
        assert_eq!(path.to_string(), "images/42/0.png");
    }

    #[test]
    fn test_single_segment_key() {
        let path = ObjectPath::new(["blob"]).unwrap();
        assert_eq!(path.to_key(), "blob");
    }

    #[test]
    fn test_empty_path_rejected() {
        let result = ObjectPath::new(Vec::<String>::new());
        assert!(matches!(result, Err(ObjectStoreError::InvalidPath(_))));
    }

    #[test]
    fn test_empty_segment_rejected() {
        let result = ObjectPath::new(["images", "", "0.png"]);
        assert!(matches!(result, Err(ObjectStoreError::InvalidPath(_))));
    }

    #[test]
    fn test_parse_from_str() {
        let path: ObjectPath = "images/42/0.png".parse().unwrap();
        assert_eq!(path.segments(), ["images", "42", "0.png"]);

        assert!("images//0.png".parse::<ObjectPath>().is_err());
        assert!("/images".parse::<ObjectPath>().is_err());
        assert!("".parse::<ObjectPath>().is_err());
    }

    #[test]
    fn test_local_path_uses_os_separator() {
        let base = Path::new("root").join("tenant-images");
        let path = ObjectPath::new(["images", "0.png"]).unwrap();
        let local = path.to_local_path(&base).unwrap();
        assert_eq!(local, base.join("images").join("0.png"));
    }

    #[test]
    fn test_local_path_rejects_traversal() {
        let base = Path::new("root");
        for bad in ["..", "."] {
            let path = ObjectPath::new(["images", bad, "x"]).unwrap();
            assert!(matches!(
                path.to_local_path(base),
                Err(ObjectStoreError::InvalidPath(_))
            ));
        }

        let path = ObjectPath::new(["a\\b"]).unwrap();
        assert!(path.to_local_path(base).is_err());
    }

    #[test]
    fn test_remote_key_keeps_opaque_segments() {
        let path = ObjectPath::new(["..", "a\\b"]).unwrap();
        assert_eq!(path.to_key(), "../a\\b");
    }
}
