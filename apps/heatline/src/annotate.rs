//! Turns a function's line-hit result into gutter labels and heat
//! buckets for the displayed source file. Pure and deterministic; the
//! host's decoration layer consumes the output directly.

use engine_proto::{HitCounts, LineHits, RetrieveLineInfoResult, SampleSourceInfo};

/// Number of heat classes lines are ranked into.
pub const HEAT_BUCKETS: usize = 10;

/// A forward jump beyond this many lines is a sentinel value (max-int or
/// similar from broken debug info), not data.
const MAX_LINE_JUMP: i64 = 100_000;

/// The function's definition line usually sits a couple of lines below
/// where the reader wants the viewport to start.
const REVEAL_CONTEXT_LINES: u32 = 2;

/// One gutter entry per displayed line; `text` is empty for lines
/// without samples. All entries share the same `width` so the labels
/// align right-justified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GutterLabel {
    pub line: u32,
    pub text: String,
    pub width: usize,
}

/// Inclusive 1-based line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpan {
    pub start: u32,
    pub end: u32,
}

impl LineSpan {
    pub fn line(line: u32) -> Self {
        Self {
            start: line,
            end: line,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineAnnotations {
    pub gutter: Vec<GutterLabel>,
    /// `HEAT_BUCKETS` collections of line ranges, coolest first.
    pub heat: Vec<Vec<LineSpan>>,
    /// The viewport should show at least this range.
    pub reveal: LineSpan,
}

/// Inputs for one annotation pass.
pub struct AnnotationRequest<'a> {
    /// 1-based line of the function definition.
    pub anchor_line: u32,
    /// The enclosing function's hit totals, one entry per sample source.
    pub function_hits: &'a [HitCounts],
    /// Unsorted per-line hits.
    pub line_hits: &'a [LineHits],
    pub sample_sources: &'a [SampleSourceInfo],
    /// Which sample source to render.
    pub source_index: usize,
    /// Total displayed lines in the document.
    pub document_lines: u32,
}

impl<'a> AnnotationRequest<'a> {
    /// Convenience constructor from a `retrieveLineInfo` result.
    pub fn from_line_info(
        info: &'a RetrieveLineInfoResult,
        sample_sources: &'a [SampleSourceInfo],
        source_index: usize,
        document_lines: u32,
    ) -> Self {
        Self {
            anchor_line: info.line_number,
            function_hits: &info.hits,
            line_hits: &info.line_hits,
            sample_sources,
            source_index,
            document_lines,
        }
    }
}

/// Renders gutter labels and heat buckets for one function's hits.
pub fn annotate(request: &AnnotationRequest) -> LineAnnotations {
    // Sources without stacks cannot aggregate beyond the leaf, so they
    // render self samples; stack-aware sources render totals.
    let use_total = request
        .sample_sources
        .get(request.source_index)
        .map(|source| source.has_stacks)
        .unwrap_or(false);
    let function_total = metric(request.function_hits, request.source_index, use_total);

    let mut sorted: Vec<&LineHits> = request.line_hits.iter().collect();
    sorted.sort_by_key(|hits| hits.line_number);

    let mut gutter = Vec::new();
    let mut heat = vec![Vec::new(); HEAT_BUCKETS];
    let mut max_width = 1usize;
    let mut cursor: i64 = 1;
    let mut first_valid: Option<u32> = None;
    let mut last_valid: Option<u32> = None;

    for hits in sorted {
        if hits.line_number < 1 {
            continue;
        }
        if hits.line_number - cursor > MAX_LINE_JUMP {
            // Sentinel line number: skip it and move the cursor past it
            // so it neither renders nor triggers a giant gap fill.
            cursor = hits.line_number.saturating_add(1);
            continue;
        }
        let line = u32::try_from(hits.line_number).unwrap_or(u32::MAX);

        let mut fill = cursor.max(1);
        while fill < i64::from(line) {
            gutter.push(GutterLabel {
                line: fill as u32,
                text: String::new(),
                width: 0,
            });
            fill += 1;
        }

        let value = metric(&hits.hits, request.source_index, use_total);
        let text = value.to_string();
        max_width = max_width.max(text.len());
        gutter.push(GutterLabel {
            line,
            text,
            width: 0,
        });
        heat[heat_bucket(value, function_total)].push(LineSpan::line(line));

        first_valid.get_or_insert(line);
        last_valid = Some(line);
        cursor = hits.line_number.saturating_add(1);
    }

    // Pad the rest of the document so every displayed line has a gutter
    // entry and the column keeps its width.
    let mut fill = cursor.max(1);
    while fill <= i64::from(request.document_lines) {
        gutter.push(GutterLabel {
            line: fill as u32,
            text: String::new(),
            width: 0,
        });
        fill += 1;
    }

    for label in &mut gutter {
        label.width = max_width;
    }

    LineAnnotations {
        gutter,
        heat,
        reveal: reveal_range(
            request.anchor_line,
            first_valid,
            last_valid,
            request.document_lines,
        ),
    }
}

/// Ranks a line's value against the function total. Integer arithmetic
/// keeps bucket boundaries exact: value/total of 0.8 with 10 buckets
/// lands in bucket 8.
fn heat_bucket(value: u64, function_total: u64) -> usize {
    if function_total == 0 {
        return 0;
    }
    let index = value.saturating_mul(HEAT_BUCKETS as u64) / function_total;
    (index as usize).min(HEAT_BUCKETS - 1)
}

/// Alpha ramp for one heat bucket's whole-line decoration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatStyle {
    pub background_alpha: f32,
    pub border_alpha: f32,
}

pub fn heat_style(bucket: usize) -> HeatStyle {
    let intensity = (bucket.min(HEAT_BUCKETS - 1) + 1) as f32 / HEAT_BUCKETS as f32;
    HeatStyle {
        background_alpha: intensity * 0.6,
        border_alpha: intensity * 0.9,
    }
}

fn metric(hits: &[HitCounts], source_index: usize, use_total: bool) -> u64 {
    hits.get(source_index)
        .map(|entry| {
            if use_total {
                entry.total_samples
            } else {
                entry.self_samples
            }
        })
        .unwrap_or(0)
}

/// The viewport range: from just above the anchor (or the first hit,
/// whichever is higher up) through the anchor or the last hit.
fn reveal_range(
    anchor_line: u32,
    first_valid: Option<u32>,
    last_valid: Option<u32>,
    document_lines: u32,
) -> LineSpan {
    let mut start = anchor_line.saturating_sub(REVEAL_CONTEXT_LINES).max(1);
    if let Some(first) = first_valid {
        start = start.min(first);
    }
    let mut end = anchor_line;
    if let Some(last) = last_valid {
        end = end.max(last);
    }
    let limit = document_lines.max(1);
    LineSpan {
        start: start.clamp(1, limit),
        end: end.clamp(1, limit),
    }
}
