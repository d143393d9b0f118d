//! Page-range partitioning for the split feature.
//!
//! Everything here is pure: validated ranges, remainders, fixed-size chunks
//! and the output units derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, AppResult};

/// 1-based inclusive page interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub from: u32,
    pub to: u32,
}

impl PageRange {
    pub fn new(from: u32, to: u32) -> Self {
        Self { from, to }
    }

    pub fn len(&self) -> u32 {
        self.to.saturating_sub(self.from) + 1
    }

    pub fn pages(&self) -> impl Iterator<Item = u32> {
        self.from..=self.to
    }

    fn within(&self, total_pages: u32) -> bool {
        self.from >= 1 && self.from <= self.to && self.to <= total_pages
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

/// Accepts `"3-7"` or a single page `"5"`.
impl FromStr for PageRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| format!("Invalid page number: {}", part.trim()))
        };
        match s.split_once('-') {
            Some((from, to)) => Ok(PageRange::new(parse(from)?, parse(to)?)),
            None => {
                let page = parse(s)?;
                Ok(PageRange::new(page, page))
            }
        }
    }
}

/// Ranges sorted by `from`, in bounds and pairwise disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeSet {
    ranges: Vec<PageRange>,
    total_pages: u32,
}

impl RangeSet {
    pub fn ranges(&self) -> &[PageRange] {
        &self.ranges
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn covered_pages(&self) -> u32 {
        self.ranges.iter().map(PageRange::len).sum()
    }
}

pub fn validate(ranges: &[PageRange], total_pages: u32) -> AppResult<RangeSet> {
    if ranges.is_empty() {
        return Err(AppError::EmptyRangeSet);
    }
    for (i, range) in ranges.iter().enumerate() {
        if !range.within(total_pages) {
            return Err(AppError::RangeOutOfBounds {
                index: i + 1,
                from: range.from,
                to: range.to,
                total: total_pages,
            });
        }
    }

    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|r| r.from);
    if let Some(i) = sorted.windows(2).position(|pair| pair[0].to >= pair[1].from) {
        return Err(AppError::OverlappingRanges {
            first: i + 1,
            second: i + 2,
        });
    }

    Ok(RangeSet {
        ranges: sorted,
        total_pages,
    })
}

/// Pages of `1..=total_pages` not covered by `ranges`, ascending.
pub fn compute_remainder(ranges: &RangeSet, total_pages: u32) -> Vec<u32> {
    let mut remaining = Vec::new();
    let mut next = 1u32;
    for range in ranges.ranges() {
        remaining.extend(next..range.from.min(total_pages + 1));
        next = next.max(range.to + 1);
    }
    if next <= total_pages {
        remaining.extend(next..=total_pages);
    }
    remaining
}

/// Consecutive chunks of `pages_per_chunk` pages; the last may be shorter.
pub fn plan_fixed(pages_per_chunk: u32, total_pages: u32) -> AppResult<Vec<PageRange>> {
    if pages_per_chunk < 1 {
        return Err(AppError::InvalidChunkSize);
    }
    let mut chunks = Vec::new();
    let mut start = 1u32;
    while start <= total_pages {
        let end = start.saturating_add(pages_per_chunk - 1).min(total_pages);
        chunks.push(PageRange::new(start, end));
        start = end + 1;
    }
    Ok(chunks)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Range,
    Chunk,
    Remainder,
}

/// One output file of a split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputUnit {
    pub name: String,
    pub kind: UnitKind,
    /// 1-based page numbers, in output order.
    pub pages: Vec<u32>,
    pub page_range: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SplitMode {
    Custom { ranges: Vec<PageRange> },
    Fixed { pages_per_chunk: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SplitPlan {
    Ranges {
        ranges: RangeSet,
        remainder: Vec<u32>,
        include_remainder: bool,
    },
    Fixed {
        pages_per_chunk: u32,
        chunks: Vec<PageRange>,
    },
}

impl SplitPlan {
    pub fn from_mode(mode: &SplitMode, total_pages: u32, include_remainder: bool) -> AppResult<Self> {
        match mode {
            SplitMode::Custom { ranges } => Self::ranges(ranges, total_pages, include_remainder),
            SplitMode::Fixed { pages_per_chunk } => Self::fixed(*pages_per_chunk, total_pages),
        }
    }

    pub fn ranges(ranges: &[PageRange], total_pages: u32, include_remainder: bool) -> AppResult<Self> {
        let ranges = validate(ranges, total_pages)?;
        let remainder = compute_remainder(&ranges, total_pages);
        Ok(SplitPlan::Ranges {
            ranges,
            remainder,
            include_remainder,
        })
    }

    pub fn fixed(pages_per_chunk: u32, total_pages: u32) -> AppResult<Self> {
        let chunks = plan_fixed(pages_per_chunk, total_pages)?;
        Ok(SplitPlan::Fixed {
            pages_per_chunk,
            chunks,
        })
    }

    /// Pages not covered by any declared range (empty for fixed plans).
    pub fn remainder(&self) -> &[u32] {
        match self {
            SplitPlan::Ranges { remainder, .. } => remainder,
            SplitPlan::Fixed { .. } => &[],
        }
    }

    pub fn units(&self) -> Vec<OutputUnit> {
        match self {
            SplitPlan::Ranges {
                ranges,
                remainder,
                include_remainder,
            } => {
                let mut units: Vec<OutputUnit> = ranges
                    .ranges()
                    .iter()
                    .enumerate()
                    .map(|(i, r)| range_unit(i, r, UnitKind::Range))
                    .collect();
                if *include_remainder && !remainder.is_empty() {
                    units.push(OutputUnit {
                        name: "remaining_pages.pdf".to_string(),
                        kind: UnitKind::Remainder,
                        pages: remainder.clone(),
                        page_range: remainder
                            .iter()
                            .map(u32::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                    });
                }
                units
            }
            SplitPlan::Fixed { chunks, .. } => chunks
                .iter()
                .enumerate()
                .map(|(i, r)| range_unit(i, r, UnitKind::Chunk))
                .collect(),
        }
    }
}

fn range_unit(i: usize, range: &PageRange, kind: UnitKind) -> OutputUnit {
    OutputUnit {
        name: format!("split_{}_pages_{}.pdf", i + 1, range),
        kind,
        pages: range.pages().collect(),
        page_range: range.to_string(),
    }
}
