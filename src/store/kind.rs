//! File classification by extension.

use serde::{Deserialize, Serialize};

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "csv", "md", "json", "xml", "yaml", "yml", "html", "js", "ts", "py", "java", "go", "rb",
    "rs", "c", "cpp", "h", "css", "sql",
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Text,
    Docx,
    Odt,
    Xlsx,
    Pptx,
    Pdf,
    Image,
    Binary,
}

impl FileKind {
    pub fn from_path(path: &str) -> Self {
        let ext = path
            .rsplit_once('.')
            .map(|(stem, ext)| {
                if stem.is_empty() || stem.ends_with('/') {
                    String::new()
                } else {
                    ext.to_ascii_lowercase()
                }
            })
            .unwrap_or_default();
        match ext.as_str() {
            "docx" => FileKind::Docx,
            "odt" => FileKind::Odt,
            "xlsx" => FileKind::Xlsx,
            "pptx" => FileKind::Pptx,
            "pdf" => FileKind::Pdf,
            e if IMAGE_EXTENSIONS.contains(&e) => FileKind::Image,
            e if TEXT_EXTENSIONS.contains(&e) => FileKind::Text,
            _ => FileKind::Binary,
        }
    }

    pub fn mime(&self, path: &str) -> &'static str {
        match self {
            FileKind::Text => match path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()) {
                Some(e) if e == "md" => "text/markdown",
                Some(e) if e == "csv" => "text/csv",
                Some(e) if e == "json" => "application/json",
                Some(e) if e == "html" => "text/html",
                Some(e) if e == "xml" => "application/xml",
                _ => "text/plain",
            },
            FileKind::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            FileKind::Odt => "application/vnd.oasis.opendocument.text",
            FileKind::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            FileKind::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
            FileKind::Pdf => "application/pdf",
            FileKind::Image => match path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()) {
                Some(e) if e == "png" => "image/png",
                Some(e) if e == "gif" => "image/gif",
                Some(e) if e == "webp" => "image/webp",
                Some(e) if e == "svg" => "image/svg+xml",
                _ => "image/jpeg",
            },
            FileKind::Binary => "application/octet-stream",
        }
    }

    /// Unsupported types are tracked but never parsed.
    pub fn is_opaque(&self) -> bool {
        matches!(self, FileKind::Binary)
    }

    /// Plain byte writes (`write_text_file`).
    pub fn accepts_text_writes(&self) -> bool {
        matches!(self, FileKind::Text)
    }

    /// Structured writes delegated to the tool worker.
    pub fn accepts_office_writes(&self) -> bool {
        matches!(self, FileKind::Docx | FileKind::Xlsx | FileKind::Pptx)
    }

    pub fn is_read_only(&self) -> bool {
        !self.accepts_text_writes() && !self.accepts_office_writes()
    }
}
