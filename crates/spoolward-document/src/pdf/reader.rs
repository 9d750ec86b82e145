// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// PDF reader: inspect, slice, and concatenate job documents using the
// `lopdf` crate. The scheduler uses this to cut a job into page-range
// segments and to append the order summary as the final sheet.

use std::collections::HashMap;

use lopdf::{Dictionary, Document, Object, ObjectId};
use spoolward_core::error::SpoolwardError;
use tracing::{debug, info, instrument, warn};

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Reads and slices existing PDF documents.
pub struct PdfReader {
    document: Document,
}

impl PdfReader {
    /// Create a reader from raw PDF bytes already in memory.
    #[instrument(skip_all, fields(bytes_len = data.len()))]
    pub fn from_bytes(data: &[u8]) -> Result<Self, SpoolwardError> {
        let document = Document::load_mem(data)
            .map_err(|err| SpoolwardError::Pdf(format!("failed to load PDF: {err}")))?;

        debug!(pages = document.get_pages().len(), "PDF loaded from bytes");
        Ok(Self { document })
    }

    /// Load several documents and concatenate them in order.
    ///
    /// Multi-file jobs are flattened this way before segmentation so page
    /// numbers run continuously across files.
    #[instrument(skip_all, fields(files = parts.len()))]
    pub fn concatenate<T: AsRef<[u8]>>(parts: &[T]) -> Result<Self, SpoolwardError> {
        let (first, rest) = parts
            .split_first()
            .ok_or_else(|| SpoolwardError::Pdf("job has no documents".into()))?;

        let mut reader = Self::from_bytes(first.as_ref())?;
        for (index, part) in rest.iter().enumerate() {
            let other = Document::load_mem(part.as_ref()).map_err(|err| {
                SpoolwardError::Pdf(format!("failed to load document #{}: {err}", index + 2))
            })?;
            append_document(&other, &mut reader.document)?;
        }

        info!(pages = reader.page_count(), "documents concatenated");
        Ok(reader)
    }

    /// Number of pages in the document.
    pub fn page_count(&self) -> u32 {
        self.document.get_pages().len() as u32
    }

    /// Serialise the whole document.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SpoolwardError> {
        let mut doc = self.document.clone();
        let mut output = Vec::new();
        doc.save_to(&mut output)
            .map_err(|err| SpoolwardError::Pdf(format!("failed to serialise PDF: {err}")))?;
        Ok(output)
    }

    /// Extract pages `start..=end` (1-indexed) into a standalone PDF.
    #[instrument(skip(self))]
    pub fn extract_range(&self, start: u32, end: u32) -> Result<Vec<u8>, SpoolwardError> {
        let total = self.page_count();
        if start == 0 || start > end || end > total {
            return Err(SpoolwardError::Pdf(format!(
                "page range {start}-{end} out of bounds (document has {total} pages)"
            )));
        }

        let pages = self.document.get_pages();
        let mut new_doc = empty_document();
        let mut copied = HashMap::new();

        for page_num in start..=end {
            let page_id = *pages.get(&page_num).ok_or_else(|| {
                SpoolwardError::Pdf(format!("page {page_num} not found in page tree"))
            })?;
            clone_page_into(&self.document, &mut new_doc, page_id, &mut copied)?;
        }

        let mut output = Vec::new();
        new_doc
            .save_to(&mut output)
            .map_err(|err| SpoolwardError::Pdf(format!("failed to serialise page range: {err}")))?;

        debug!(start, end, output_bytes = output.len(), "page range extracted");
        Ok(output)
    }

    /// This document followed by every page of `tail`.
    #[instrument(skip_all, fields(tail_bytes = tail.len()))]
    pub fn with_appended(&self, tail: &[u8]) -> Result<Vec<u8>, SpoolwardError> {
        let other = Document::load_mem(tail)
            .map_err(|err| SpoolwardError::Pdf(format!("failed to load appended PDF: {err}")))?;

        let mut merged = self.document.clone();
        append_document(&other, &mut merged)?;

        let mut output = Vec::new();
        merged
            .save_to(&mut output)
            .map_err(|err| SpoolwardError::Pdf(format!("failed to serialise merged PDF: {err}")))?;
        Ok(output)
    }
}

/// A document with an empty page tree and a catalog pointing at it.
fn empty_document() -> Document {
    let mut doc = Document::with_version("1.5");

    let mut pages = Dictionary::new();
    pages.set("Type", Object::Name(b"Pages".to_vec()));
    pages.set("Kids", Object::Array(Vec::new()));
    pages.set("Count", Object::Integer(0));
    let pages_id = doc.add_object(Object::Dictionary(pages));

    let mut catalog = Dictionary::new();
    catalog.set("Type", Object::Name(b"Catalog".to_vec()));
    catalog.set("Pages", Object::Reference(pages_id));
    let catalog_id = doc.add_object(Object::Dictionary(catalog));

    doc.trailer.set("Root", Object::Reference(catalog_id));
    doc
}

/// Append every page of `source` to `target`, in page order.
fn append_document(source: &Document, target: &mut Document) -> Result<(), SpoolwardError> {
    let mut copied = HashMap::new();
    for (_, page_id) in source.get_pages() {
        clone_page_into(source, target, page_id, &mut copied)?;
    }
    Ok(())
}

/// Clone a page and everything it references from `source` into `target`,
/// appending it as the last page of `target`'s page tree.
///
/// `copied` maps source object ids to ids already created in `target`, so
/// shared resources are cloned once and reference cycles terminate.
fn clone_page_into(
    source: &Document,
    target: &mut Document,
    page_id: ObjectId,
    copied: &mut HashMap<ObjectId, ObjectId>,
) -> Result<(), SpoolwardError> {
    let page = source
        .get_object(page_id)
        .and_then(Object::as_dict)
        .map_err(|err| SpoolwardError::Pdf(format!("cannot read page {page_id:?}: {err}")))?;

    let mut page_dict = page.clone();
    for key in INHERITABLE {
        if page_dict.has(key) {
            continue;
        }
        if let Some(value) = inherited_attribute(source, page, key) {
            page_dict.set(key.to_vec(), value);
        }
    }

    let cloned = deep_clone_object(source, target, &Object::Dictionary(page_dict), copied)?;
    let cloned_id = target.add_object(cloned);

    let pages_id = target
        .catalog()
        .and_then(|catalog| catalog.get(b"Pages"))
        .and_then(Object::as_reference)
        .map_err(|err| SpoolwardError::Pdf(format!("target has no page tree: {err}")))?;

    if let Ok(Object::Dictionary(pages_dict)) = target.get_object_mut(pages_id) {
        if let Ok(Object::Array(kids)) = pages_dict.get_mut(b"Kids") {
            kids.push(Object::Reference(cloned_id));
        }
        if let Ok(Object::Integer(count)) = pages_dict.get_mut(b"Count") {
            *count += 1;
        }
    }

    if let Ok(Object::Dictionary(page_dict)) = target.get_object_mut(cloned_id) {
        page_dict.set("Parent", Object::Reference(pages_id));
    }

    Ok(())
}

/// Walk up the `/Parent` chain looking for an inheritable attribute.
fn inherited_attribute(source: &Document, page: &Dictionary, key: &[u8]) -> Option<Object> {
    let mut current = page.get(b"Parent").and_then(Object::as_reference).ok();
    // Page trees are shallow; the bound only guards against malformed cycles.
    for _ in 0..32 {
        let node = source.get_object(current?).and_then(Object::as_dict).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        current = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

/// Deep-clone a lopdf object, resolving references into new objects in
/// `target`. `/Parent` is skipped; the caller patches it.
fn deep_clone_object(
    source: &Document,
    target: &mut Document,
    object: &Object,
    copied: &mut HashMap<ObjectId, ObjectId>,
) -> Result<Object, SpoolwardError> {
    match object {
        Object::Dictionary(dict) => Ok(Object::Dictionary(clone_dictionary(
            source, target, dict, copied,
        )?)),
        Object::Array(arr) => {
            let mut new_arr = Vec::with_capacity(arr.len());
            for item in arr {
                new_arr.push(deep_clone_object(source, target, item, copied)?);
            }
            Ok(Object::Array(new_arr))
        }
        Object::Reference(ref_id) => {
            if let Some(existing) = copied.get(ref_id) {
                return Ok(Object::Reference(*existing));
            }
            match source.get_object(*ref_id) {
                Ok(referenced) => {
                    // Reserve the id first so cycles resolve to it.
                    let new_id = target.new_object_id();
                    copied.insert(*ref_id, new_id);
                    let cloned = deep_clone_object(source, target, referenced, copied)?;
                    target.objects.insert(new_id, cloned);
                    Ok(Object::Reference(new_id))
                }
                Err(err) => {
                    warn!(?ref_id, %err, "cannot resolve reference, using Null");
                    Ok(Object::Null)
                }
            }
        }
        Object::Stream(stream) => {
            let dict = clone_dictionary(source, target, &stream.dict, copied)?;
            Ok(Object::Stream(lopdf::Stream::new(dict, stream.content.clone())))
        }
        other => Ok(other.clone()),
    }
}

fn clone_dictionary(
    source: &Document,
    target: &mut Document,
    dict: &Dictionary,
    copied: &mut HashMap<ObjectId, ObjectId>,
) -> Result<Dictionary, SpoolwardError> {
    let mut new_dict = Dictionary::new();
    for (key, value) in dict.iter() {
        if key == b"Parent" {
            continue;
        }
        let cloned_value = deep_clone_object(source, target, value, copied)?;
        new_dict.set(key.clone(), cloned_value);
    }
    Ok(new_dict)
}
