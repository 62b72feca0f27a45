//! Score parsing.
//!
//! A score is a list of `i` statements plus an optional `e` end marker.
//! `i 1.60 0 -1 60 100` starts instrument 1 as the tagged instance `1.60`
//! at time 0, held (duration -1), with p4=60 p5=100. A negative tag,
//! `i -1.60 0 0 0`, releases the held instance with the same tag. Times
//! are in seconds relative to when the statement is read.

use cadenza_core::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ScoreEvent {
    Start {
        /// Fractional instrument tag, e.g. 1.60
        tag: f32,
        /// Start time in seconds
        start: f64,
        /// Duration in seconds; negative means held until released
        dur: f64,
        /// p4 and up
        pfields: Vec<f32>,
    },
    Stop {
        tag: f32,
        start: f64,
    },
}

impl ScoreEvent {
    pub fn start_time(&self) -> f64 {
        match self {
            Self::Start { start, .. } | Self::Stop { start, .. } => *start,
        }
    }
}

/// Parse score text into events. Statements after `e` are ignored.
pub fn parse_score(text: &str) -> Result<Vec<ScoreEvent>> {
    let mut events = Vec::new();

    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let head = fields.next().unwrap();
        match head {
            "e" => break,
            "i" => {
                let numbers: Vec<f64> = fields
                    .map(|f| {
                        f.parse().map_err(|_| {
                            EngineError::Error(format!(
                                "score line {}: bad field '{f}'",
                                line_no + 1
                            ))
                        })
                    })
                    .collect::<Result<_>>()?;
                if numbers.len() < 3 {
                    return Err(EngineError::Error(format!(
                        "score line {}: 'i' needs at least p1 p2 p3",
                        line_no + 1
                    )));
                }

                let tag = numbers[0];
                let start = numbers[1].max(0.0);
                if tag < 0.0 {
                    events.push(ScoreEvent::Stop {
                        tag: -tag as f32,
                        start,
                    });
                } else {
                    events.push(ScoreEvent::Start {
                        tag: tag as f32,
                        start,
                        dur: numbers[2],
                        pfields: numbers[3..].iter().map(|&n| n as f32).collect(),
                    });
                }
            }
            other => {
                return Err(EngineError::Error(format!(
                    "score line {}: unknown statement '{other}'",
                    line_no + 1
                )));
            }
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_note_on_off() {
        let events = parse_score("i 1.60 0 -1 60 100\ni -1.60 0 0 0\ne\n").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ScoreEvent::Start {
                tag: 1.60,
                start: 0.0,
                dur: -1.0,
                pfields: vec![60.0, 100.0],
            }
        );
        assert_eq!(
            events[1],
            ScoreEvent::Stop {
                tag: 1.60,
                start: 0.0,
            }
        );
    }

    #[test]
    fn test_timed_notes() {
        let events = parse_score("i 1 0 0.5 60 100\ni 1 0.5 0.5 64 100\n").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].start_time(), 0.5);
    }

    #[test]
    fn test_comments_and_blanks() {
        let events = parse_score("; intro\n\ni 2 0 1 ; a note\n").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_statements_after_end_are_ignored() {
        let events = parse_score("i 1 0 1\ne\ni 1 2 1\n").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_bad_statement_is_rejected() {
        assert!(parse_score("f 1 0 1024 10 1\n").is_err());
        assert!(parse_score("i 1 0\n").is_err());
    }
}
