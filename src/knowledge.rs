//! Loads tenant knowledge documents from local files.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::Database;

#[derive(Debug, Clone, Default, Serialize)]
pub struct KnowledgeImportReport {
    pub files_matched: usize,
    pub documents_imported: usize,
    pub errors: Vec<String>,
}

fn looks_like_html(path: &Path, content: &str) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("html") | Some("htm")
    ) || content.contains("<html")
        || content.contains("<body")
}

fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 120)
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Title is the file stem; re-importing the same file replaces its content.
fn document_title(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.replace(['_', '-'], " ").trim().to_string())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| path.display().to_string())
}

fn import_file(db: &Database, tenant_id: &str, path: &Path) -> Result<bool> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read knowledge file {}", path.display()))?;
    let content = if looks_like_html(path, &raw) {
        html_to_text(&raw)
    } else {
        raw.trim().to_string()
    };
    if content.is_empty() {
        debug!(path = %path.display(), "skipping empty knowledge file");
        return Ok(false);
    }

    db.upsert_knowledge_document(tenant_id, &document_title(path), &content)
        .with_context(|| format!("store knowledge document from {}", path.display()))?;
    Ok(true)
}

pub fn import_glob(db: &Database, tenant_id: &str, pattern: &str) -> Result<KnowledgeImportReport> {
    if db.get_tenant(tenant_id)?.is_none() {
        return Err(anyhow!("tenant not found: {tenant_id}"));
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    let mut report = KnowledgeImportReport::default();
    for entry in glob::glob(pattern).with_context(|| format!("invalid glob pattern '{pattern}'"))? {
        match entry {
            Ok(path) if path.is_file() => paths.push(path),
            Ok(_) => {}
            Err(error) => report.errors.push(error.to_string()),
        }
    }
    paths.sort();
    report.files_matched = paths.len();

    for path in paths {
        match import_file(db, tenant_id, &path) {
            Ok(true) => report.documents_imported += 1,
            Ok(false) => {}
            Err(error) => {
                warn!(path = %path.display(), error = %format!("{error:#}"), "knowledge import failed");
                report.errors.push(format!("{}: {error:#}", path.display()));
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::{document_title, import_glob};
    use crate::db::models::Tenant;
    use crate::db::Database;

    fn temp_root() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("ars-knowledge-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path).expect("create temp root");
        path
    }

    #[test]
    fn titles_come_from_file_stems() {
        assert_eq!(document_title(&PathBuf::from("/kb/visa_requirements.md")), "visa requirements");
    }

    #[test]
    fn imports_text_and_html_and_skips_empty_files() {
        let root = temp_root();
        let kb = root.join("kb");
        std::fs::create_dir_all(&kb).expect("create kb dir");
        std::fs::write(kb.join("fees.txt"), "Tuition is 9000 EUR per year.\n").expect("write");
        std::fs::write(
            kb.join("deadlines.html"),
            "<html><body><h1>Deadlines</h1><p>Applications close on 30 June.</p></body></html>",
        )
        .expect("write");
        std::fs::write(kb.join("empty.txt"), "   \n").expect("write");

        let db = Database::open(&root.join("ars.db")).expect("open db");
        db.upsert_tenant(&Tenant::new("t-1", "office@example.edu"))
            .expect("insert tenant");

        let pattern = format!("{}/*", kb.display());
        let report = import_glob(&db, "t-1", &pattern).expect("import");
        assert_eq!(report.files_matched, 3);
        assert_eq!(report.documents_imported, 2);
        assert!(report.errors.is_empty());

        let documents = db.list_knowledge_documents("t-1").expect("list");
        let deadlines = documents
            .iter()
            .find(|document| document.title == "deadlines")
            .expect("deadlines document");
        assert!(deadlines.content.contains("Applications close on 30 June."));
        assert!(!deadlines.content.contains("<p>"));

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_tenant_is_rejected() {
        let root = temp_root();
        let db = Database::open(&root.join("ars.db")).expect("open db");
        assert!(import_glob(&db, "missing", "*.txt").is_err());
        let _ = std::fs::remove_dir_all(root);
    }
}
