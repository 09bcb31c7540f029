//! Merge engine: stored page artifacts → one PDF.
//!
//! Every artifact is a complete single- or multi-page PDF. The engine loads
//! each with `lopdf`, renumbers its objects past everything merged so far,
//! and re-parents its pages under one fresh page tree:
//!
//! ```text
//! artifact 1 ─┐                    ┌─ Catalog ─ Pages ─┬─ p1 (art. 1)
//! artifact 2 ─┼─▶ load ▶ renumber ─┤                   ├─ p2 (art. 2)
//! artifact 3 ─┘   (skip on error)  └─ trailer.Root     └─ p3 (art. 3)
//! ```
//!
//! Attributes a page inherits from its old tree (`MediaBox`, `Resources`, …)
//! are copied onto the page first, because the old tree does not survive.

use chrono::{DateTime, Local};
use lopdf::{dictionary, Document, Object, ObjectId};
use once_cell::sync::Lazy;
use page_store::PageArtifact;
use percent_encoding::percent_decode_str;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{PageError, PipelineError};

/// Page attributes that may live on an ancestor `Pages` node.
const INHERITABLE: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

static FORBIDDEN_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F\x7F]"#).expect("static regex"));

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

static LIBRARY_VIEW_SLUG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/library/view/([^/?#]+)").expect("static regex"));

/// The result of a successful merge.
#[derive(Debug, Clone)]
pub struct MergedDocument {
    /// Serialised PDF.
    pub bytes: Vec<u8>,
    /// `<title>_<YYYYMMDD_HHMMSS>.pdf` or `merged_<…>.pdf`.
    pub suggested_name: String,
    /// Pages in the output.
    pub page_count: usize,
    /// Artifacts that could not be parsed and are missing from the output.
    pub skipped: Vec<PageError>,
}

/// Concatenate `pages` in ascending index order.
///
/// Fails with [`PipelineError::MergeFailure`] when `pages` is empty or no
/// artifact yields a page. Individual unparseable artifacts are skipped and
/// listed in [`MergedDocument::skipped`].
pub fn merge(
    mut pages: Vec<PageArtifact>,
    title: Option<&str>,
    title_max_len: usize,
) -> Result<MergedDocument, PipelineError> {
    if pages.is_empty() {
        return Err(PipelineError::MergeFailure("no page artifacts given".into()));
    }
    pages.sort_by_key(|p| p.index);
    let artifact_count = pages.len();

    let mut out = Document::with_version("1.5");
    let pages_id = out.new_object_id();
    let mut kids: Vec<ObjectId> = Vec::new();
    let mut skipped = Vec::new();

    for artifact in pages {
        let index = artifact.index;
        let loaded = Document::load_mem(&artifact.payload);
        // Payload is no longer needed once parsed.
        drop(artifact);

        let mut doc = match loaded {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Skipping page {}: not a parseable PDF: {}", index, e);
                skipped.push(PageError::ParseFailed {
                    page: index,
                    detail: e.to_string(),
                });
                continue;
            }
        };

        doc.renumber_objects_with(out.max_id + 1);
        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        if page_ids.is_empty() {
            warn!("Skipping page {}: document has no pages", index);
            skipped.push(PageError::ParseFailed {
                page: index,
                detail: "document has no pages".into(),
            });
            continue;
        }

        for &page_id in &page_ids {
            flatten_inherited(&mut doc, page_id);
        }

        debug!("Page {} contributes {} page(s)", index, page_ids.len());
        out.max_id = out.max_id.max(doc.max_id);
        out.objects.extend(doc.objects);

        for page_id in page_ids {
            if let Ok(dict) = out.get_object_mut(page_id).and_then(Object::as_dict_mut) {
                dict.set("Parent", pages_id);
            }
            kids.push(page_id);
        }
    }

    if kids.is_empty() {
        return Err(PipelineError::MergeFailure(format!(
            "none of the {artifact_count} stored page(s) could be parsed"
        )));
    }

    let page_count = kids.len();
    out.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids.into_iter().map(Object::Reference).collect::<Vec<_>>(),
            "Count" => page_count as i64,
        }),
    );
    let catalog_id = out.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    out.trailer.set("Root", catalog_id);
    out.prune_objects();

    let mut bytes = Vec::new();
    out.save_to(&mut bytes)
        .map_err(|e| PipelineError::MergeFailure(format!("serialising merged PDF: {e}")))?;

    let suggested_name = output_file_name(title, Local::now(), title_max_len);
    info!(
        "Merged {} page(s) from {} artifact(s) into {} ({} bytes, {} skipped)",
        page_count,
        artifact_count,
        suggested_name,
        bytes.len(),
        skipped.len()
    );

    Ok(MergedDocument {
        bytes,
        suggested_name,
        page_count,
        skipped,
    })
}

/// Copy inheritable attributes from the page's ancestors onto the page.
fn flatten_inherited(doc: &mut Document, page_id: ObjectId) {
    let mut found: Vec<(&[u8], Object)> = Vec::new();
    {
        let Ok(page) = doc.get_object(page_id).and_then(Object::as_dict) else {
            return;
        };
        let mut missing: Vec<&[u8]> = INHERITABLE
            .iter()
            .copied()
            .filter(|key| !page.has(key))
            .collect();

        let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
        // Bounded walk; a malformed tree may contain a cycle.
        let mut depth = 0;
        while let (Some(id), false) = (parent, missing.is_empty()) {
            depth += 1;
            if depth > 64 {
                break;
            }
            let Ok(node) = doc.get_object(id).and_then(Object::as_dict) else {
                break;
            };
            missing.retain(|key| match node.get(key) {
                Ok(value) => {
                    found.push((*key, value.clone()));
                    false
                }
                Err(_) => true,
            });
            parent = node.get(b"Parent").and_then(Object::as_reference).ok();
        }
    }

    if found.is_empty() {
        return;
    }
    if let Ok(page) = doc.get_object_mut(page_id).and_then(Object::as_dict_mut) {
        for (key, value) in found {
            page.set(key.to_vec(), value);
        }
    }
}

/// Replace characters that are unsafe in file names and collapse whitespace.
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_title(title: &str, max_len: usize) -> Option<String> {
    let replaced = FORBIDDEN_CHARS.replace_all(title.trim(), "_");
    let collapsed = WHITESPACE_RUN.replace_all(replaced.trim(), "_");
    let capped: String = collapsed.chars().take(max_len).collect();
    let capped = capped.trim_end_matches('_');
    if capped.is_empty() {
        None
    } else {
        Some(capped.to_string())
    }
}

/// `<sanitized title>_<YYYYMMDD_HHMMSS>.pdf`, or `merged_<…>.pdf`.
pub fn output_file_name(title: Option<&str>, at: DateTime<Local>, title_max_len: usize) -> String {
    let stamp = at.format("%Y%m%d_%H%M%S");
    let stem = title
        .and_then(|t| sanitize_title(t, title_max_len))
        .unwrap_or_else(|| "merged".to_string());
    format!("{stem}_{stamp}.pdf")
}

/// Book title from a `/library/view/<slug>/…` URL, if it has one.
///
/// The slug is percent-decoded and its dashes become spaces.
pub fn title_from_target(target: &str) -> Option<String> {
    let slug = LIBRARY_VIEW_SLUG.captures(target)?.get(1)?.as_str();
    let decoded = percent_decode_str(slug).decode_utf8_lossy();
    let title = decoded.replace('-', " ").trim().to_string();
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}
