//! Document loader
//!
//! Format-dispatched parsing into normalized text records plus metadata.
//! Text formats are parsed locally; images and audio are delegated to the
//! media gateway and carry a non-text modality.

use crate::errors::IngestionError;
use crate::media::MediaGateway;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, warn};

/// Supported file extensions.
pub const SUPPORTED_EXTENSIONS: [&str; 13] = [
    "pdf", "txt", "md", "docx", "doc", "html", "htm", "csv", "png", "jpg", "jpeg", "mp3", "wav",
];

/// Extensions parsed as plain text (the smaller size limit applies).
const TEXT_EXTENSIONS: [&str; 5] = ["txt", "md", "html", "htm", "csv"];

/// Chunk modality carried in the vector payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Audio => "audio",
        }
    }

    /// Modality implied by a file extension.
    pub fn from_extension(ext: &str) -> Modality {
        match ext {
            "png" | "jpg" | "jpeg" => Modality::Image,
            "mp3" | "wav" => Modality::Audio,
            _ => Modality::Text,
        }
    }
}

/// One normalized text record produced from a source file.
#[derive(Debug, Clone)]
pub struct LoadedRecord {
    pub text: String,
    pub modality: Modality,
    /// SHA-256 of the raw bytes
    pub content_hash: String,
    pub source: String,
}

/// Validate extension and size limits without reading the file contents.
pub fn validate_path(
    path: &Path,
    max_file_bytes: usize,
    max_text_bytes: usize,
) -> Result<String, IngestionError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(IngestionError::UnsupportedFormat { extension: ext });
    }

    let metadata = std::fs::metadata(path)
        .map_err(|_| IngestionError::FileNotFound(path.display().to_string()))?;
    let size = metadata.len() as usize;

    let limit = if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        max_text_bytes
    } else {
        max_file_bytes
    };
    if size > limit {
        return Err(IngestionError::FileTooLarge { size, limit });
    }

    Ok(ext)
}

/// Load a file into normalized records.
pub async fn load_document(
    path: &Path,
    extension: &str,
    media: &dyn MediaGateway,
) -> Result<LoadedRecord, IngestionError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|_| IngestionError::FileNotFound(path.display().to_string()))?;

    let content_hash = hex::encode(Sha256::digest(&bytes));
    let source = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let modality = Modality::from_extension(extension);

    let text = match extension {
        "txt" | "md" => String::from_utf8_lossy(&bytes).to_string(),
        "html" | "htm" => strip_html(&String::from_utf8_lossy(&bytes)),
        "csv" => flatten_csv(&String::from_utf8_lossy(&bytes)),
        "pdf" => extract_pdf_text(path)?,
        "docx" | "doc" => extract_docx_text(path, &bytes)?,
        "png" | "jpg" | "jpeg" => media.caption_image(&bytes, &source).await?,
        "mp3" | "wav" => media.transcribe_audio(&bytes, &source).await?,
        other => {
            return Err(IngestionError::UnsupportedFormat {
                extension: other.to_string(),
            })
        }
    };

    let text = normalize_whitespace(&text);
    if text.is_empty() {
        return Err(IngestionError::ParseError {
            path: path.display().to_string(),
            message: "no text content extracted".to_string(),
        });
    }

    debug!(
        source = %source,
        bytes = bytes.len(),
        text_len = text.len(),
        modality = modality.as_str(),
        "Document loaded"
    );

    Ok(LoadedRecord {
        text,
        modality,
        content_hash,
        source,
    })
}

/// Collapse runs of whitespace but keep paragraph breaks, which the chunker
/// prefers as split points.
fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, paragraph) in text.split("\n\n").enumerate() {
        let collapsed = paragraph.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            continue;
        }
        if i > 0 && !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&collapsed);
    }
    out.trim().to_string()
}

/// Minimal tag stripper for HTML sources. Script and style bodies are
/// dropped entirely.
fn strip_html(html: &str) -> String {
    let cleaned = remove_blocks(html, "script");
    let cleaned = remove_blocks(&cleaned, "style");

    let mut text = String::with_capacity(cleaned.len());
    let mut in_tag = false;
    for ch in cleaned.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }

    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Remove `<tag ...>...</tag>` blocks, case-insensitively.
fn remove_blocks(input: &str, tag: &str) -> String {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let lower = input.to_ascii_lowercase();

    let mut out = String::with_capacity(input.len());
    let mut pos = 0;
    while let Some(start_rel) = lower[pos..].find(&open) {
        let start = pos + start_rel;
        out.push_str(&input[pos..start]);
        match lower[start..].find(&close) {
            Some(end_rel) => pos = start + end_rel + close.len(),
            None => return out,
        }
    }
    out.push_str(&input[pos..]);
    out
}

/// Flatten CSV rows into sentences so they survive chunking.
fn flatten_csv(csv: &str) -> String {
    let mut lines = csv.lines();
    let header: Vec<&str> = lines
        .next()
        .map(|h| h.split(',').map(str::trim).collect())
        .unwrap_or_default();

    let mut out = String::new();
    for line in lines {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        if cells.iter().all(|c| c.is_empty()) {
            continue;
        }
        let row: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match header.get(i) {
                Some(name) if !name.is_empty() => format!("{name}: {cell}"),
                _ => cell.to_string(),
            })
            .collect();
        out.push_str(&row.join(", "));
        out.push('\n');
    }

    if out.is_empty() {
        // Header-only file: index the header itself.
        header.join(", ")
    } else {
        out
    }
}

/// Extract text from a PDF content stream, page by page. Pages that fail to
/// parse are skipped.
fn extract_pdf_text(path: &Path) -> Result<String, IngestionError> {
    let doc = lopdf::Document::load(path).map_err(|e| IngestionError::ParseError {
        path: path.display().to_string(),
        message: format!("failed to load PDF: {e}"),
    })?;

    let pages = doc.get_pages();
    let page_numbers: Vec<u32> = pages.keys().copied().collect();

    let mut text = String::new();
    for page_num in page_numbers {
        match doc.extract_text(&[page_num]) {
            Ok(page_text) => {
                text.push_str(&page_text);
                text.push('\n');
            }
            Err(e) => {
                warn!(page = page_num, error = %e, "Failed to extract page text, skipping");
            }
        }
    }

    if text.trim().is_empty() {
        return Err(IngestionError::ParseError {
            path: path.display().to_string(),
            message: "no text content extracted from PDF".to_string(),
        });
    }

    Ok(text)
}

/// Extract text from a docx archive (`word/document.xml` with tags
/// stripped). Legacy `.doc` files go through the same path and fail with a
/// parse error when they are not zip containers.
fn extract_docx_text(path: &Path, bytes: &[u8]) -> Result<String, IngestionError> {
    use std::io::Read;

    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor).map_err(|e| IngestionError::ParseError {
        path: path.display().to_string(),
        message: format!("not a docx container: {e}"),
    })?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| IngestionError::ParseError {
            path: path.display().to_string(),
            message: format!("missing document body: {e}"),
        })?
        .read_to_string(&mut xml)
        .map_err(|e| IngestionError::ParseError {
            path: path.display().to_string(),
            message: format!("failed to read document body: {e}"),
        })?;

    // Paragraph closes become paragraph breaks before tag stripping.
    let xml = xml.replace("</w:p>", "\n\n");
    Ok(strip_html(&xml))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MockMediaGateway;
    use std::io::Write;

    fn write_temp(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[test]
    fn validate_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "notes.xyz", b"hello");
        let err = validate_path(&path, 1000, 1000).unwrap_err();
        assert!(matches!(err, IngestionError::UnsupportedFormat { .. }));
    }

    #[test]
    fn validate_applies_text_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "big.txt", &vec![b'a'; 64]);
        let err = validate_path(&path, 1000, 32).unwrap_err();
        assert!(matches!(err, IngestionError::FileTooLarge { .. }));
        assert!(validate_path(&path, 1000, 128).is_ok());
    }

    #[tokio::test]
    async fn loads_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "faq.txt", b"Our refund window is 14 days.");
        let media = MockMediaGateway::default();

        let record = load_document(&path, "txt", &media).await.unwrap();
        assert_eq!(record.text, "Our refund window is 14 days.");
        assert_eq!(record.modality, Modality::Text);
        assert_eq!(record.source, "faq.txt");
        assert_eq!(record.content_hash.len(), 64);
    }

    #[tokio::test]
    async fn html_tags_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let html = b"<html><head><style>p{color:red}</style></head><body><p>Refunds take 14 days.</p><script>alert(1)</script></body></html>";
        let path = write_temp(&dir, "page.html", html);
        let media = MockMediaGateway::default();

        let record = load_document(&path, "html", &media).await.unwrap();
        assert!(record.text.contains("Refunds take 14 days."));
        assert!(!record.text.contains("alert"));
        assert!(!record.text.contains("color:red"));
    }

    #[tokio::test]
    async fn csv_rows_carry_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "plans.csv", b"plan,price\nbasic,10\npro,30\n");
        let media = MockMediaGateway::default();

        let record = load_document(&path, "csv", &media).await.unwrap();
        assert!(record.text.contains("plan: basic, price: 10"));
        assert!(record.text.contains("plan: pro, price: 30"));
    }

    #[tokio::test]
    async fn images_use_the_caption_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "shot.png", &[0x89, 0x50, 0x4e, 0x47]);
        let media = MockMediaGateway::default();

        let record = load_document(&path, "png", &media).await.unwrap();
        assert_eq!(record.modality, Modality::Image);
        assert_eq!(record.text, "A screenshot of the product dashboard.");
    }

    #[tokio::test]
    async fn audio_uses_the_transcript_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "call.wav", b"RIFF");
        let media = MockMediaGateway::default();

        let record = load_document(&path, "wav", &media).await.unwrap();
        assert_eq!(record.modality, Modality::Audio);
        assert!(record.text.contains("help with my order"));
    }

    #[test]
    fn modality_from_extension() {
        assert_eq!(Modality::from_extension("png"), Modality::Image);
        assert_eq!(Modality::from_extension("mp3"), Modality::Audio);
        assert_eq!(Modality::from_extension("pdf"), Modality::Text);
    }

    #[test]
    fn normalize_keeps_paragraph_breaks() {
        let text = "line one   with   spaces\n\n\n\nline two";
        assert_eq!(normalize_whitespace(text), "line one with spaces\n\nline two");
    }
}
