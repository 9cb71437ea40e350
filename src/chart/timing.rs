use std::collections::BTreeMap;
use std::path::Path;

use crate::arrows::encoding::{ArrowVocabulary, EncodedArrows};
use crate::error::{Result, StepError};

const NOTES_MARKER: &str = "NOTES";
const DIFFICULTY_MARKER: &str = "DIFFICULTY";

/// One charted onset, encoded once at parse time.
#[derive(Clone, Debug, PartialEq)]
pub struct NoteTimingEvent {
    pub time_secs: f64,
    pub arrows: EncodedArrows,
}

/// Onsets of every difficulty in one timing file, keyed by lower-cased difficulty name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NoteChart {
    pub difficulties: BTreeMap<String, Vec<NoteTimingEvent>>,
}

impl NoteChart {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse the line-oriented timing format.
    ///
    /// Nothing is read before the `NOTES` line. `DIFFICULTY <name>` opens a
    /// bucket; note lines are `<arrows> <seconds> [ignored...]`.
    pub fn parse(content: &str) -> Result<Self> {
        let mut difficulties: BTreeMap<String, Vec<NoteTimingEvent>> = BTreeMap::new();
        let mut in_notes = false;
        let mut current: Option<String> = None;

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim_end();

            if line.starts_with(NOTES_MARKER) {
                in_notes = true;
                continue;
            }
            if !in_notes || line.trim().is_empty() {
                continue;
            }

            if line.starts_with(DIFFICULTY_MARKER) {
                let name = line
                    .split_whitespace()
                    .nth(1)
                    .ok_or_else(|| StepError::Chart {
                        line: line_no,
                        reason: "difficulty marker without a name".into(),
                    })?
                    .to_lowercase();
                if difficulties.contains_key(&name) {
                    return Err(StepError::DuplicateDifficulty(name));
                }
                difficulties.insert(name.clone(), Vec::new());
                current = Some(name);
                continue;
            }

            let Some(ref difficulty) = current else {
                continue;
            };

            let event = parse_note_line(line, line_no)?;
            if let Some(events) = difficulties.get_mut(difficulty) {
                events.push(event);
            }
        }

        Ok(Self { difficulties })
    }
}

fn parse_note_line(line: &str, line_no: usize) -> Result<NoteTimingEvent> {
    let mut tokens = line.split_whitespace();
    let (Some(arrow_token), Some(time_token)) = (tokens.next(), tokens.next()) else {
        return Err(StepError::Chart {
            line: line_no,
            reason: format!("expected '<arrows> <seconds>', found '{}'", line.trim()),
        });
    };

    let arrows = ArrowVocabulary.encode(arrow_token).map_err(|e| StepError::Chart {
        line: line_no,
        reason: e.to_string(),
    })?;
    let time_secs = time_token
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
        .ok_or_else(|| StepError::Chart {
            line: line_no,
            reason: format!("invalid timestamp '{}'", time_token),
        })?;

    Ok(NoteTimingEvent { time_secs, arrows })
}

/// Read a plain onset list: one timestamp in seconds per line, blank lines skipped.
pub fn parse_onset_times(content: &str) -> Result<Vec<f64>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            line.trim()
                .parse::<f64>()
                .ok()
                .filter(|t| t.is_finite())
                .ok_or_else(|| StepError::Chart {
                    line: index + 1,
                    reason: format!("invalid timestamp '{}'", line.trim()),
                })
        })
        .collect()
}
