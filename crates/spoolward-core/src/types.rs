// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for Spoolward print workers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SpoolwardError;

/// Unique identifier for a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of one worker process, as written into `owner_worker_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declares `as_str` / `FromStr` / `Display` for a lowercase keyword enum
/// stored as plain text in SQLite.
macro_rules! keyword_enum {
    ($name:ident { $($variant:ident => $kw:literal),+ $(,)? }) => {
        impl $name {
            /// Storage keyword for this value.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $kw),+
                }
            }
        }

        impl FromStr for $name {
            type Err = SpoolwardError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($kw => Ok(Self::$variant),)+
                    other => Err(SpoolwardError::Database(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Payment state of the order behind a job. Written by order intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

keyword_enum!(PaymentStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Refunded => "refunded",
});

/// Lifecycle states of a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed and owned by exactly one worker.
    Printing,
    /// Physically printed. Terminal unless an operator reprints.
    Printed,
}

keyword_enum!(PrintStatus {
    Pending => "pending",
    Printing => "printing",
    Printed => "printed",
});

/// Status of one page segment inside a mixed-mode job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Pending,
    Printing,
    Completed,
    Failed,
}

keyword_enum!(SegmentStatus {
    Pending => "pending",
    Printing => "printing",
    Completed => "completed",
    Failed => "failed",
});

/// Ink mode of a single physical submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintMode {
    Color,
    Bw,
}

keyword_enum!(PrintMode {
    Color => "color",
    Bw => "bw",
});

/// Colour mode requested for a whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    Color,
    Bw,
    /// Some pages colour, some black & white. Split into segments.
    Mixed,
}

/// Standard paper sizes, smallest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperSize {
    A5,
    Letter,
    A4,
    Legal,
    Tabloid,
    A3,
}

impl PaperSize {
    /// Dimensions in millimetres (width, height).
    pub fn dimensions_mm(&self) -> (u32, u32) {
        match self {
            Self::A5 => (148, 210),
            Self::Letter => (216, 279),
            Self::A4 => (210, 297),
            Self::Legal => (216, 356),
            Self::Tabloid => (279, 432),
            Self::A3 => (297, 420),
        }
    }

    /// Position in the size hierarchy used for capability checks.
    /// A printer whose maximum has rank `n` can print any size of rank `<= n`.
    pub fn rank(&self) -> u8 {
        match self {
            Self::A5 => 1,
            Self::Letter => 2,
            Self::A4 => 3,
            Self::Legal => 4,
            Self::Tabloid => 5,
            Self::A3 => 6,
        }
    }
}

/// Duplex printing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplexMode {
    Simplex,
    LongEdge,
    ShortEdge,
}

impl DuplexMode {
    pub fn is_duplex(&self) -> bool {
        !matches!(self, Self::Simplex)
    }
}

/// Inclusive, 1-indexed page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Number of pages covered by the range.
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Colour classification of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageColor {
    pub page_number: u32,
    pub mode: PrintMode,
}

/// Page classification as delivered by order intake.
///
/// Older clients send an object keyed by page number, newer ones a list.
/// Both are accepted here and collapsed into one ordered list by
/// [`PageColorInput::normalize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageColorInput {
    List(Vec<PageColor>),
    Map(BTreeMap<String, PrintMode>),
}

impl PageColorInput {
    /// Convert to a list sorted by page number. A page listed twice keeps
    /// its last classification.
    pub fn normalize(self) -> Result<Vec<PageColor>, SpoolwardError> {
        let mut pages: BTreeMap<u32, PrintMode> = BTreeMap::new();
        match self {
            Self::List(list) => {
                for pc in list {
                    if pc.page_number == 0 {
                        return Err(SpoolwardError::InvalidPageColor(
                            "page numbers start at 1".into(),
                        ));
                    }
                    pages.insert(pc.page_number, pc.mode);
                }
            }
            Self::Map(map) => {
                for (key, mode) in map {
                    let page_number: u32 = key.trim().parse().map_err(|_| {
                        SpoolwardError::InvalidPageColor(format!("'{key}' is not a page number"))
                    })?;
                    if page_number == 0 {
                        return Err(SpoolwardError::InvalidPageColor(
                            "page numbers start at 1".into(),
                        ));
                    }
                    pages.insert(page_number, mode);
                }
            }
        }
        Ok(pages
            .into_iter()
            .map(|(page_number, mode)| PageColor { page_number, mode })
            .collect())
    }
}

fn normalized_page_colors<'de, D>(deserializer: D) -> Result<Vec<PageColor>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let input = Option::<PageColorInput>::deserialize(deserializer)?;
    match input {
        Some(input) => input.normalize().map_err(serde::de::Error::custom),
        None => Ok(Vec::new()),
    }
}

/// What a job asks of the printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintRequirements {
    pub paper_size: PaperSize,
    pub color_mode: ColorMode,
    pub duplex: DuplexMode,
    pub copies: u32,
    /// Page count declared at intake. The fetched document is authoritative.
    pub page_count: u32,
    /// Per-page classification for mixed jobs. Accepts either intake shape
    /// and is normalized on the way in; always written back as a list.
    #[serde(default, deserialize_with = "normalized_page_colors")]
    pub page_colors: Vec<PageColor>,
}

impl Default for PrintRequirements {
    fn default() -> Self {
        Self {
            paper_size: PaperSize::A4,
            color_mode: ColorMode::Bw,
            duplex: DuplexMode::Simplex,
            copies: 1,
            page_count: 1,
            page_colors: Vec::new(),
        }
    }
}

/// A contiguous page range sharing one print mode, dispatched on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: String,
    pub page_range: PageRange,
    pub print_mode: PrintMode,
    pub copies: u32,
    pub paper_size: PaperSize,
    pub duplex: DuplexMode,
    pub status: SegmentStatus,
    pub segment_token: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Segment {
    /// Fresh pending segment for `page_range`, inheriting job settings.
    pub fn new(page_range: PageRange, print_mode: PrintMode, req: &PrintRequirements) -> Self {
        Self {
            segment_id: Uuid::new_v4().to_string(),
            page_range,
            print_mode,
            copies: req.copies,
            paper_size: req.paper_size,
            duplex: req.duplex,
            status: SegmentStatus::Pending,
            segment_token: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// A print job as recorded in the shared store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    /// Human-facing order reference printed on the summary sheet.
    pub order_number: String,
    pub payment_status: PaymentStatus,
    pub print_status: PrintStatus,
    pub print_error: Option<String>,
    pub printer_id: Option<String>,
    pub printer_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Fresh per claim. Kept after completion so duplicates can be detected.
    pub idempotency_token: Option<String>,
    pub print_attempt: u32,
    pub max_print_attempts: u32,
    pub owner_worker_id: Option<WorkerId>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub segments: Vec<Segment>,
    pub requirements: PrintRequirements,
    /// Document references resolved by the document transport, in order.
    pub files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrintJob {
    pub fn new(order_number: impl Into<String>, files: Vec<String>, requirements: PrintRequirements) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            order_number: order_number.into(),
            payment_status: PaymentStatus::Pending,
            print_status: PrintStatus::Pending,
            print_error: None,
            printer_id: None,
            printer_name: None,
            started_at: None,
            completed_at: None,
            idempotency_token: None,
            print_attempt: 0,
            max_print_attempts: 3,
            owner_worker_id: None,
            heartbeat_at: None,
            segments: Vec::new(),
            requirements,
            files,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mixed jobs are split into independently dispatched segments.
    pub fn is_segmented(&self) -> bool {
        self.requirements.color_mode == ColorMode::Mixed
    }

    /// Whether another claim would exceed the attempt budget.
    pub fn attempts_exhausted(&self) -> bool {
        self.print_attempt >= self.max_print_attempts
    }
}

/// Operational state reported by the fleet for a printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterStatus {
    Online,
    Busy,
    Offline,
    Error,
}

keyword_enum!(PrinterStatus {
    Online => "online",
    Busy => "busy",
    Offline => "offline",
    Error => "error",
});

/// What a printer declares it can do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterCapabilities {
    /// Largest paper the printer accepts.
    pub max_paper_size: PaperSize,
    pub color: bool,
    pub duplex: bool,
    /// Maximum copies per submission (0 = unlimited).
    pub max_copies: u32,
}

/// A printer known to the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Printer {
    pub id: String,
    pub name: String,
    /// Transport address, e.g. `192.168.1.40:9100`.
    pub uri: String,
    pub active: bool,
    pub auto_print: bool,
    pub status: PrinterStatus,
    pub queue_length: u32,
    /// `None` for printers registered before capabilities were tracked.
    pub capabilities: Option<PrinterCapabilities>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_colors_from_object_shape() {
        let input: PageColorInput =
            serde_json::from_str(r#"{"3": "color", "1": "bw", "2": "color"}"#).unwrap();
        let pages = input.normalize().unwrap();
        let numbers: Vec<u32> = pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(pages[0].mode, PrintMode::Bw);
        assert_eq!(pages[2].mode, PrintMode::Color);
    }

    #[test]
    fn page_colors_from_list_shape() {
        let input: PageColorInput = serde_json::from_str(
            r#"[{"pageNumber": 2, "mode": "bw"}, {"pageNumber": 1, "mode": "color"}]"#,
        )
        .unwrap();
        let pages = input.normalize().unwrap();
        assert_eq!(
            pages,
            vec![
                PageColor { page_number: 1, mode: PrintMode::Color },
                PageColor { page_number: 2, mode: PrintMode::Bw },
            ]
        );
    }

    #[test]
    fn page_colors_reject_bad_keys() {
        let input: PageColorInput = serde_json::from_str(r#"{"first": "color"}"#).unwrap();
        assert!(input.normalize().is_err());

        let zero: PageColorInput = serde_json::from_str(r#"{"0": "color"}"#).unwrap();
        assert!(zero.normalize().is_err());
    }

    #[test]
    fn requirements_accept_either_page_color_shape() {
        let mut value = serde_json::to_value(PrintRequirements {
            color_mode: ColorMode::Mixed,
            page_count: 3,
            ..Default::default()
        })
        .unwrap();
        value["page_colors"] = serde_json::json!({"2": "bw", "1": "color"});
        let from_object: PrintRequirements = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(
            from_object.page_colors,
            vec![
                PageColor { page_number: 1, mode: PrintMode::Color },
                PageColor { page_number: 2, mode: PrintMode::Bw },
            ]
        );

        // Written back as a list, which reads the same.
        let stored = serde_json::to_value(&from_object).unwrap();
        assert!(stored["page_colors"].is_array());
        let reread: PrintRequirements = serde_json::from_value(stored).unwrap();
        assert_eq!(reread.page_colors, from_object.page_colors);

        value["page_colors"] = serde_json::Value::Null;
        let none: PrintRequirements = serde_json::from_value(value.clone()).unwrap();
        assert!(none.page_colors.is_empty());

        value["page_colors"] = serde_json::json!({"0": "color"});
        assert!(serde_json::from_value::<PrintRequirements>(value).is_err());
    }

    #[test]
    fn status_keywords_round_trip_through_strings() {
        for status in [PrintStatus::Pending, PrintStatus::Printing, PrintStatus::Printed] {
            assert_eq!(status.as_str().parse::<PrintStatus>().unwrap(), status);
        }
        assert!("queued".parse::<PrintStatus>().is_err());
    }

    #[test]
    fn paper_rank_follows_size() {
        assert!(PaperSize::A3.rank() > PaperSize::A4.rank());
        assert!(PaperSize::A4.rank() > PaperSize::Letter.rank());
        assert!(PaperSize::Letter.rank() > PaperSize::A5.rank());
    }

    #[test]
    fn page_range_len() {
        assert_eq!(PageRange::new(3, 5).len(), 3);
        assert_eq!(PageRange::new(9, 9).len(), 1);
        assert_eq!(PageRange::new(3, 5).to_string(), "3-5");
    }
}
