use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Text export of one converted file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedDocument {
    pub markdown: String,
    pub page_count: usize,
}

/// Turns files on disk into markdown text. Results are in input order.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, paths: &[PathBuf]) -> Result<Vec<ConvertedDocument>>;
}

/// PDF, DOCX and plain-text conversion without external services.
#[derive(Debug, Default, Clone)]
pub struct LocalDocumentConverter;

impl LocalDocumentConverter {
    pub fn new() -> Self {
        Self
    }

    pub fn convert_file(path: &Path) -> Result<ConvertedDocument> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => convert_pdf(path),
            "docx" => Ok(ConvertedDocument {
                markdown: convert_docx(path)?,
                page_count: 1,
            }),
            _ => {
                let markdown = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read text file: {}", path.display()))?;
                Ok(ConvertedDocument {
                    markdown,
                    page_count: 1,
                })
            }
        }
    }
}

#[async_trait]
impl DocumentConverter for LocalDocumentConverter {
    async fn convert(&self, paths: &[PathBuf]) -> Result<Vec<ConvertedDocument>> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.clone();
            let converted = tokio::task::spawn_blocking(move || Self::convert_file(&path))
                .await
                .context("Document conversion task panicked")??;
            results.push(converted);
        }
        tracing::debug!(count = results.len(), "Converted documents");
        Ok(results)
    }
}

fn convert_pdf(path: &Path) -> Result<ConvertedDocument> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read PDF: {}", path.display()))?;

    let page_count = lopdf::Document::load_mem(&bytes)
        .map(|doc| doc.get_pages().len())
        .with_context(|| format!("Failed to load PDF structure: {}", path.display()))?;

    let text = pdf_extract::extract_text_from_mem(&bytes)
        .map_err(|e| anyhow!("Failed to extract PDF text from {}: {}", path.display(), e))?;

    let markdown = text
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    Ok(ConvertedDocument {
        markdown,
        page_count: page_count.max(1),
    })
}

fn convert_docx(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open DOCX: {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read DOCX as ZIP: {}", path.display()))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .with_context(|| format!("DOCX missing word/document.xml: {}", path.display()))?
        .read_to_string(&mut xml)
        .context("Failed to read document.xml from DOCX")?;

    Ok(docx_paragraphs(&xml).join("\n\n"))
}

/// Text runs (`<w:t>`) grouped by paragraph (`<w:p>`).
fn docx_paragraphs(xml: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut rest = xml;

    while let Some(p_start) = find_tag(rest, "<w:p") {
        let after = &rest[p_start..];
        let p_end = after.find("</w:p>").map(|e| e + 6).unwrap_or(after.len());
        let paragraph = &after[..p_end];

        let mut text = String::new();
        let mut runs = paragraph;
        while let Some(t_start) = find_tag(runs, "<w:t") {
            let run = &runs[t_start..];
            let Some(open_end) = run.find('>') else { break };
            let content = &run[open_end + 1..];
            let Some(close) = content.find("</w:t>") else { break };
            text.push_str(&unescape_xml(&content[..close]));
            runs = &content[close + 6..];
        }

        if !text.trim().is_empty() {
            paragraphs.push(text);
        }
        rest = &after[p_end..];
    }

    paragraphs
}

/// Find `tag` only where it is followed by `>`, whitespace or `/`, so `<w:p`
/// does not match `<w:pPr>`.
fn find_tag(haystack: &str, tag: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(pos) = haystack[offset..].find(tag) {
        let abs = offset + pos;
        match haystack[abs + tag.len()..].chars().next() {
            Some('>') | Some(' ') | Some('/') => return Some(abs),
            _ => offset = abs + tag.len(),
        }
    }
    None
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docx_paragraphs() {
        let xml = r#"<w:body><w:p><w:pPr><w:pStyle w:val="Title"/></w:pPr><w:r><w:t>Pump</w:t></w:r><w:r><w:t xml:space="preserve"> manual</w:t></w:r></w:p><w:p/><w:p><w:r><w:t>Flow &amp; pressure</w:t></w:r></w:p></w:body>"#;
        assert_eq!(docx_paragraphs(xml), vec!["Pump manual", "Flow & pressure"]);
    }

    #[tokio::test]
    async fn test_convert_plain_text_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.md");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "# Alpha").unwrap();
        std::fs::write(&b, "beta").unwrap();

        let converted = LocalDocumentConverter::new().convert(&[a, b]).await.unwrap();
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].markdown, "# Alpha");
        assert_eq!(converted[1].markdown, "beta");
        assert_eq!(converted[1].page_count, 1);
    }

    #[tokio::test]
    async fn test_convert_missing_file_fails() {
        let result = LocalDocumentConverter::new()
            .convert(&[PathBuf::from("/nonexistent/file.txt")])
            .await;
        assert!(result.is_err());
    }
}
