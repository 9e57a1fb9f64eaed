//! Named text fields and named file blobs submitted with a request.
//!
//! # Design
//! Fields and blobs live in separate namespaces, each an insertion-ordered
//! list so the multipart body and the GET query string come out in a
//! deterministic order. Overwriting a name keeps its original position.
//! A `PayloadSet` is consumed by `Request::send`, which is what guarantees
//! each blob source is read at most once.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::error::RequestError;

/// A file attachment: the filename written in `Content-Disposition` and the
/// byte source streamed into the part body. Dropping the blob closes the
/// source.
pub struct Blob {
    filename: String,
    source: Box<dyn Read + Send>,
}

impl Blob {
    pub fn new(filename: impl Into<String>, source: impl Read + Send + 'static) -> Self {
        Self {
            filename: filename.into(),
            source: Box::new(source),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub(crate) fn into_parts(self) -> (String, Box<dyn Read + Send>) {
        (self.filename, self.source)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct PayloadSet {
    fields: Vec<(String, String)>,
    blobs: Vec<(String, Blob)>,
}

impl PayloadSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a text field, returning the value it replaced.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.fields.push((name, value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Overwrite an existing field. Fails if `name` was never added.
    pub fn replace(
        &mut self,
        name: &str,
        value: impl Into<String>,
    ) -> Result<String, RequestError> {
        let (_, slot) = self
            .fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| RequestError::InvalidArgument(format!("no field named {name}")))?;
        Ok(std::mem::replace(slot, value.into()))
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    /// Attach a file. A previous blob under the same name is dropped.
    pub fn add_file(
        &mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        source: impl Read + Send + 'static,
    ) {
        let name = name.into();
        let blob = Blob::new(filename, source);
        match self.blobs.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = blob,
            None => self.blobs.push((name, blob)),
        }
    }

    /// Attach a file from disk; the filename is the path's last component.
    pub fn add_file_path(
        &mut self,
        name: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<(), RequestError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(RequestError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} isn't a file", path.display()),
            )));
        }
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = File::open(path)?;
        self.add_file(name, filename, file);
        Ok(())
    }

    pub fn remove_file(&mut self, name: &str) -> Option<Blob> {
        let idx = self.blobs.iter().position(|(n, _)| n == name)?;
        Some(self.blobs.remove(idx).1)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn blobs(&self) -> impl Iterator<Item = (&str, &Blob)> {
        self.blobs.iter().map(|(n, b)| (n.as_str(), b))
    }

    pub fn has_files(&self) -> bool {
        !self.blobs.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.blobs.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<(String, String)>, Vec<(String, Blob)>) {
        (self.fields, self.blobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn add_overwrites_in_place() {
        let mut p = PayloadSet::new();
        assert_eq!(p.add("a", "1"), None);
        assert_eq!(p.add("b", "2"), None);
        assert_eq!(p.add("a", "3").as_deref(), Some("1"));
        let fields: Vec<_> = p.fields().collect();
        assert_eq!(fields, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn replace_requires_existing_field() {
        let mut p = PayloadSet::new();
        let err = p.replace("missing", "x").unwrap_err();
        assert!(matches!(err, RequestError::InvalidArgument(_)));
        assert_eq!(p.get("missing"), None);

        p.add("k", "old");
        assert_eq!(p.replace("k", "new").unwrap(), "old");
        assert_eq!(p.get("k"), Some("new"));
    }

    #[test]
    fn remove_returns_previous_or_none() {
        let mut p = PayloadSet::new();
        assert_eq!(p.remove("x"), None);
        p.add("x", "1");
        p.add("y", "2");
        assert_eq!(p.remove("x").as_deref(), Some("1"));
        assert_eq!(p.fields().collect::<Vec<_>>(), vec![("y", "2")]);
    }

    #[test]
    fn fields_and_blobs_are_separate_namespaces() {
        let mut p = PayloadSet::new();
        p.add("doc", "text");
        p.add_file("doc", "doc.bin", Cursor::new(vec![1u8, 2]));
        assert_eq!(p.get("doc"), Some("text"));
        assert!(p.has_files());

        p.add_file("doc", "other.bin", Cursor::new(Vec::new()));
        let names: Vec<_> = p.blobs().map(|(n, b)| (n, b.filename())).collect();
        assert_eq!(names, vec![("doc", "other.bin")]);

        assert!(p.remove_file("doc").is_some());
        assert!(!p.has_files());
        assert!(!p.is_empty());
    }

    #[test]
    fn add_file_path_rejects_directories() {
        let dir = std::env::temp_dir();
        let err = PayloadSet::new().add_file_path("f", &dir).unwrap_err();
        match err {
            RequestError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn add_file_path_uses_last_component() {
        let path =
            std::env::temp_dir().join(format!("xhr-core-payload-{}.txt", std::process::id()));
        std::fs::write(&path, b"contents").unwrap();
        let mut p = PayloadSet::new();
        p.add_file_path("upload", &path).unwrap();
        let (_, blob) = p.blobs().next().unwrap();
        assert_eq!(blob.filename(), path.file_name().unwrap().to_str().unwrap());
        std::fs::remove_file(&path).unwrap();
    }
}
