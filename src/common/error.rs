use std::io;

/// The error type for the tom document layer: reading, parsing and writing
/// the XML files that back mounted toms.
///
/// Failures of this kind are fatal to the storage operation that triggered
/// them and propagate to the caller unchanged. A key or path that is simply
/// absent is *not* an error; it is folded into the operation's return value.
#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    /// The tom file could not be opened, created or written.
    #[error("failed to access tom document `{path}`")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The tom file exists but is not a well-formed XML document.
    #[error("tom document `{path}` is not well-formed XML")]
    Xml {
        path: String,
        #[source]
        source: quick_xml::Error,
    },

    /// A leaf held text that does not parse as the requested key or mapped
    /// type.
    #[error("leaf `{leaf}` holds `{text}`, which does not parse as the requested type")]
    Parse { leaf: String, text: String },
}

impl DocumentError {
    pub(crate) fn io(path: &str, source: io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }

    pub(crate) fn xml(path: &str, source: quick_xml::Error) -> Self {
        Self::Xml {
            path: path.to_owned(),
            source,
        }
    }

    pub(crate) fn parse(leaf: &str, text: &str) -> Self {
        Self::Parse {
            leaf: leaf.to_owned(),
            text: text.to_owned(),
        }
    }
}

/// The error type for [`Storage`][crate::Storage] operations.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// The virtual path has no prefix registered in the mount table.
    #[error("virtual path `{0}` has no mounted prefix")]
    UnmountedPath(String),

    /// A tom document could not be read, parsed or written back.
    #[error(transparent)]
    Document(#[from] DocumentError),
}
