//! Time and queue display helpers shared by replies.

use crate::error::{QueueError, Result};
use crate::queue::SessionQueue;
use crate::track::{Track, TrackStatus};

/// Entries shown by the show-queue reply.
pub const QUEUE_PAGE_SIZE: usize = 10;

/// `H:MM:SS` from one hour up, `M:SS` below.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

/// Parse a seek argument: `SS`, `MM:SS`, `HH:MM:SS`, or `90s` / `5m` / `1h`.
pub fn parse_time_string(input: &str) -> Result<u64> {
    let s = input.trim().to_ascii_lowercase();
    let invalid = || QueueError::InvalidTime(input.trim().to_string());

    if s.is_empty() {
        return Err(invalid());
    }

    if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() > 3 {
            return Err(invalid());
        }
        let mut total: u64 = 0;
        for (i, part) in parts.iter().enumerate() {
            let value: u64 = part.parse().map_err(|_| invalid())?;
            // Every field after the first is a sexagesimal digit.
            if i > 0 && value >= 60 {
                return Err(invalid());
            }
            total = total.checked_mul(60).ok_or_else(invalid)? + value;
        }
        return Ok(total);
    }

    let (digits, unit) = match s.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&s[..idx], Some(c)),
        _ => (s.as_str(), None),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let factor = match unit {
        None | Some('s') => 1,
        Some('m') => 60,
        Some('h') => 3600,
        Some(_) => return Err(invalid()),
    };
    value.checked_mul(factor).ok_or_else(invalid)
}

fn track_length(track: &Track) -> String {
    if track.is_live() {
        "Live".to_string()
    } else {
        format_duration(track.duration_seconds())
    }
}

/// One line of the queue listing.
pub fn format_track_line(position: usize, track: &Track) -> String {
    let marker = match track.status {
        TrackStatus::Playing => "▶ ",
        TrackStatus::Fetching => "⏬ ",
        _ => "",
    };
    format!(
        "{position}. {marker}{} [{}]",
        track.title(),
        track_length(track)
    )
}

/// Render the first page of the queue.
pub fn format_queue_page(queue: &SessionQueue) -> String {
    if queue.is_empty() {
        return "The queue is empty".to_string();
    }

    let mut lines: Vec<String> = queue
        .iter()
        .take(QUEUE_PAGE_SIZE)
        .enumerate()
        .map(|(i, track)| format_track_line(i + 1, track))
        .collect();

    if queue.len() > QUEUE_PAGE_SIZE {
        lines.push(format!("...and {} more", queue.len() - QUEUE_PAGE_SIZE));
    }
    lines.push(format!("Loop: {}", queue.loop_mode()));
    lines.join("\n")
}
