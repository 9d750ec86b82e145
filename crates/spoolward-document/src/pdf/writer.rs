// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// PDF writer: render plain-text sheets (the order summary) with `printpdf` 0.8.
//
// printpdf 0.8 uses a data-oriented API: documents are built by constructing
// `PdfPage` structs containing `Vec<Op>` operation lists, then serialised via
// `PdfDocument::save()`.

use printpdf::{BuiltinFont, Mm, Op, PdfDocument, PdfPage, PdfSaveOptions, PdfWarnMsg, Point, Pt, TextItem};
use spoolward_core::PaperSize;
use spoolward_core::error::SpoolwardError;
use tracing::{debug, instrument};

const FONT_SIZE_PT: f32 = 11.0;
const LINE_HEIGHT_PT: f32 = 14.0;
const MARGIN_MM: f32 = 20.0;

/// Creates text-only PDF sheets.
pub struct PdfWriter {
    paper_size: PaperSize,
    title: Option<String>,
}

impl PdfWriter {
    pub fn new(paper_size: PaperSize) -> Self {
        Self {
            paper_size,
            title: None,
        }
    }

    /// Create a new writer defaulting to A4.
    pub fn a4() -> Self {
        Self::new(PaperSize::A4)
    }

    /// Set a title for the PDF metadata.
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(title.into());
    }

    fn page_dimensions(&self) -> (Mm, Mm) {
        let (w_mm, h_mm) = self.paper_size.dimensions_mm();
        (Mm(w_mm as f32), Mm(h_mm as f32))
    }

    /// Render one page per entry of `pages`.
    ///
    /// Each entry is laid out top-down in Helvetica; long lines wrap and
    /// anything that overflows the sheet is cut, so the page count always
    /// equals `pages.len()`.
    #[instrument(skip_all, fields(pages = pages.len()))]
    pub fn create_pages<T: AsRef<str>>(&self, pages: &[T]) -> Result<Vec<u8>, SpoolwardError> {
        if pages.is_empty() {
            return Err(SpoolwardError::Pdf("no pages to render".into()));
        }

        let (page_w, page_h) = self.page_dimensions();
        let title = self.title.as_deref().unwrap_or("Spoolward");

        let margin_pt = Mm(MARGIN_MM).into_pt().0;
        let usable_width_mm = page_w.0 - 2.0 * MARGIN_MM;
        // Average Helvetica glyph is ~0.5em; 1pt = 0.3528mm.
        let avg_char_width_mm = 0.50 * FONT_SIZE_PT * 0.3528;
        let max_chars_per_line = (usable_width_mm / avg_char_width_mm) as usize;

        let page_h_pt = page_h.into_pt().0;
        let lines_per_page = ((page_h_pt - 2.0 * margin_pt) / LINE_HEIGHT_PT) as usize;

        let mut doc = PdfDocument::new(title);
        let mut rendered: Vec<PdfPage> = Vec::with_capacity(pages.len());

        for text in pages {
            let lines = wrap_text(text.as_ref(), max_chars_per_line);
            let mut ops: Vec<Op> = Vec::new();

            for (line_idx, line) in lines.iter().take(lines_per_page).enumerate() {
                let y_pt = page_h_pt - margin_pt - (line_idx as f32 * LINE_HEIGHT_PT);
                ops.push(Op::StartTextSection);
                ops.push(Op::SetTextCursor {
                    pos: Point {
                        x: Pt(margin_pt),
                        y: Pt(y_pt),
                    },
                });
                ops.push(Op::SetFontSizeBuiltinFont {
                    size: Pt(FONT_SIZE_PT),
                    font: BuiltinFont::Helvetica,
                });
                ops.push(Op::WriteTextBuiltinFont {
                    items: vec![TextItem::Text(line.clone())],
                    font: BuiltinFont::Helvetica,
                });
                ops.push(Op::EndTextSection);
            }

            rendered.push(PdfPage::new(page_w, page_h, ops));
        }

        doc.with_pages(rendered);

        let mut warnings: Vec<PdfWarnMsg> = Vec::new();
        let output = doc.save(&PdfSaveOptions::default(), &mut warnings);
        debug!(bytes = output.len(), warnings = warnings.len(), "text pages rendered");
        Ok(output)
    }
}

/// Wrap a multi-line string so that no line exceeds `max_width` characters.
/// Words longer than `max_width` are force-broken.
fn wrap_text(text: &str, max_width: usize) -> Vec<String> {
    let max_width = max_width.max(1);
    let mut result = Vec::new();

    for paragraph in text.split('\n') {
        let words: Vec<&str> = paragraph.split_whitespace().collect();
        if words.is_empty() {
            result.push(String::new());
            continue;
        }

        let mut current = String::with_capacity(max_width);
        for word in words {
            let mut word: Vec<char> = word.chars().collect();
            while word.len() > max_width {
                if !current.is_empty() {
                    result.push(std::mem::take(&mut current));
                }
                let rest = word.split_off(max_width);
                result.push(word.into_iter().collect());
                word = rest;
            }
            let word: String = word.into_iter().collect();
            let current_len = current.chars().count();
            if current.is_empty() {
                current = word;
            } else if current_len + 1 + word.chars().count() <= max_width {
                current.push(' ');
                current.push_str(&word);
            } else {
                result.push(std::mem::replace(&mut current, word));
            }
        }
        if !current.is_empty() {
            result.push(current);
        }
    }

    result
}
