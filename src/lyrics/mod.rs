//! Timed-text lyrics conversion.
//!
//! Paragraphs under `tt/body/div` become display lines. Lines are ordered by
//! their begin offset in seconds, never by document position.

use std::cmp::Ordering;

use log::debug;
use roxmltree::{Document, Node};

use crate::config::LyricsFormat;
use crate::error::CoreError;

/// One display line.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedLine {
    /// Offset exactly as written in the document.
    pub begin_offset: String,
    /// Normalized `[mm:ss.ff]` stamp.
    pub rendered_timestamp: String,
    pub text: String,
    seconds: f64,
}

impl TimedLine {
    pub fn seconds(&self) -> f64 {
        self.seconds
    }
}

/// Parses `mm:ss.ff`, `hh:mm:ss.fff`, or bare seconds (optionally suffixed
/// with `s`) into total seconds.
pub fn parse_offset(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('s').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return None;
    }
    let mut total = 0.0f64;
    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    for part in &parts {
        let value: f64 = part.trim().parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        total = total * 60.0 + value;
    }
    Some(total)
}

/// Renders total seconds as `[mm:ss.ff]`, rounding to hundredths.
pub fn format_timestamp(seconds: f64) -> String {
    let centis = (seconds * 100.0).round().max(0.0) as u64;
    let minutes = centis / 6000;
    let secs = (centis / 100) % 60;
    let hundredths = centis % 100;
    format!("[{minutes:02}:{secs:02}.{hundredths:02}]")
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn paragraph_text(paragraph: Node<'_, '_>) -> String {
    let raw: String = paragraph
        .descendants()
        .filter(Node::is_text)
        .filter_map(|node| node.text())
        .collect();
    collapse_whitespace(&raw)
}

/// Extracts every timed paragraph, sorted ascending by offset.
pub fn parse_lines(document: &str) -> Result<Vec<TimedLine>, CoreError> {
    let parsed = Document::parse(document)
        .map_err(|error| CoreError::Parse(format!("timed text: {error}")))?;
    let Some(body) = parsed
        .root_element()
        .children()
        .find(|node| node.has_tag_name("body"))
    else {
        return Err(CoreError::Parse("timed text has no body".to_string()));
    };

    let mut lines = Vec::new();
    for division in body.children().filter(|node| node.has_tag_name("div")) {
        for paragraph in division.children().filter(|node| node.has_tag_name("p")) {
            let Some(begin) = paragraph.attribute("begin") else {
                continue;
            };
            let Some(seconds) = parse_offset(begin) else {
                debug!("Lyrics: skipping paragraph with offset '{}'", begin);
                continue;
            };
            lines.push(TimedLine {
                begin_offset: begin.to_string(),
                rendered_timestamp: format_timestamp(seconds),
                text: paragraph_text(paragraph),
                seconds,
            });
        }
    }
    lines.sort_by(|left, right| {
        left.seconds
            .partial_cmp(&right.seconds)
            .unwrap_or(Ordering::Equal)
    });
    Ok(lines)
}

/// Renders a line-timed lyric text, or `None` when nothing usable was found.
pub fn convert(document: &str) -> Option<String> {
    match parse_lines(document) {
        Ok(lines) if !lines.is_empty() => Some(
            lines
                .iter()
                .map(|line| format!("{}{}", line.rendered_timestamp, line.text))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Ok(_) => None,
        Err(error) => {
            debug!("Lyrics: conversion failed: {}", error);
            None
        }
    }
}

/// Applies the configured output format. `Ttml` returns the document as-is.
pub fn render(document: &str, format: LyricsFormat) -> Option<String> {
    match format {
        LyricsFormat::Ttml if !document.trim().is_empty() => Some(document.to_string()),
        LyricsFormat::Ttml => None,
        LyricsFormat::Lrc => convert(document),
    }
}
