//! Verifier transcript parsing.
//!
//! The stdout of a failed `saw` run is the coverage signal. This module
//! extracts structured error records from it. Four error shapes are
//! recognized, each by a distinct anchor line; anything else in the
//! transcript is ignored, but a failing transcript that yields no record
//! at all is a hard error (it means the verifier grew a new error shape
//! that must be taught to the parser).

use std::cmp::Ordering;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

static SUBGOAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[\d\d:\d\d:\d\d\.\d\d\d\] Subgoal failed: (.+?) (.+?):$").expect("valid regex")
});
static ASSERTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s\sAssertion made at: (.+?)$").expect("valid regex"));
static TRACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^"(.*?)" \((.*?)\)$"#).expect("valid regex"));
static OVERRIDE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^- Name: (.*)$").expect("valid regex"));
static OVERRIDE_LOC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Location: (.*)$").expect("valid regex"));
static OVERRIDE_ERR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\* (.*): error: (.*)$").expect("valid regex"));

const OVERRIDE_PRECONDITIONS: &str =
    "The following overrides had some preconditions that failed concretely:";

/// One structured error extracted from a verifier transcript.
///
/// `item` is the script name; `details` carries the kind-specific record.
/// Equality (and the derived hash) is structural over every field, so
/// coverage sets deduplicate by value. The total order compares the
/// canonical JSON serialization, so coverage sets sort and dump
/// deterministically across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerificationError {
    pub item: String,
    pub details: ErrorDetails,
}

impl VerificationError {
    /// Canonical serialized form used for ordering.
    pub fn canonical(&self) -> String {
        // Struct fields serialize in declaration order, which makes this
        // form canonical; serialization of these shapes cannot fail.
        serde_json::to_string(self).expect("verification error serializes")
    }
}

impl Ord for VerificationError {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical().cmp(&other.canonical())
    }
}

impl PartialOrd for VerificationError {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Kind-specific payload of a [`VerificationError`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ErrorDetails {
    /// A proof subgoal was falsified.
    #[serde(rename = "subgoal failed")]
    SubgoalFailed {
        goal: String,
        location: String,
        /// Literal placeholder kept from the era when the transcript
        /// format dropped the trailing message group.
        message: String,
        details: String,
        extra: Vec<String>,
    },

    /// Symbolic execution aborted before the proof obligations.
    #[serde(rename = "symbolic execution failed")]
    SymbolicExecutionFailed {
        reason: String,
        #[serde(flatten)]
        abort: AbortDetails,
    },

    /// A specification-level assertion was violated.
    #[serde(rename = "assertion failed")]
    AssertionFailed { message: String, location: String },

    /// The prover gave up without a verdict.
    #[serde(rename = "prover unknown")]
    ProverUnknown { trace: Vec<String> },
}

/// Why symbolic execution aborted. Branch records nest recursively and
/// carry neither a `type` nor a `reason` field, matching the transcript
/// structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AbortDetails {
    Assertion {
        location: String,
        category: String,
        extra: Vec<String>,
    },
    BothBranches {
        location: String,
        branch_t: Box<AbortDetails>,
        branch_f: Box<AbortDetails>,
    },
}

/// Parse a transcript into the details records of all recognized errors.
///
/// `wks` is the workspace path prefix stripped from locations; `path` is
/// the transcript file, used in error messages only.
pub fn parse_transcript(wks: &str, path: &Path, content: &str) -> Result<Vec<ErrorDetails>> {
    let lines: Vec<String> = content.lines().map(|l| l.trim_end().to_string()).collect();
    let parser = TranscriptParser { wks, path, lines };

    let mut details = Vec::new();
    details.extend(parser.search_subgoal_failed()?);
    details.extend(parser.search_symexec_failed()?);
    details.extend(parser.search_assertion_failed()?);
    details.extend(parser.search_prover_unknown()?);
    Ok(details)
}

struct TranscriptParser<'a> {
    wks: &'a str,
    path: &'a Path,
    lines: Vec<String>,
}

impl TranscriptParser<'_> {
    fn line(&self, idx: usize) -> Result<&str> {
        self.lines.get(idx).map(String::as_str).ok_or_else(|| {
            Error::transcript(
                self.path,
                format!("unexpected end of transcript at line {idx}"),
            )
        })
    }

    fn fail(&self, message: impl Into<String>) -> Error {
        Error::transcript(self.path, message)
    }

    fn strip_wks(&self, location: &str) -> String {
        location
            .strip_prefix(self.wks)
            .unwrap_or(location)
            .to_string()
    }

    /// Kind A: `Subgoal failed` banner lines.
    fn search_subgoal_failed(&self) -> Result<Vec<ErrorDetails>> {
        let mut result = Vec::new();

        for (i, line) in self.lines.iter().enumerate() {
            let Some(caps) = SUBGOAL_RE.captures(line) else {
                continue;
            };
            let goal = caps[1].to_string();
            let location = self.strip_wks(&caps[2]);
            let details = self.line(i + 1)?.trim().to_string();

            let mut extra = Vec::new();
            if self.lines.get(i + 2).map(String::as_str) == Some("Details:") {
                for cursor in &self.lines[i + 3..] {
                    if !cursor.starts_with(' ') {
                        break;
                    }
                    extra.push(cursor.trim().to_string());
                }
            }

            result.push(ErrorDetails::SubgoalFailed {
                goal,
                location,
                message: "message".to_string(),
                details,
                extra,
            });
        }

        Ok(result)
    }

    /// Kind B: `Symbolic execution failed.` blocks.
    fn search_symexec_failed(&self) -> Result<Vec<ErrorDetails>> {
        let anchors: Vec<usize> = self
            .lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.as_str() == "Symbolic execution failed.")
            .map(|(i, _)| i)
            .collect();

        let mut result = Vec::new();
        for i in anchors {
            let reason = self.line(i + 1)?.trim().to_string();
            let (abort, _) = self.parse_abort(&reason, i + 1)?;
            result.push(ErrorDetails::SymbolicExecutionFailed { reason, abort });
        }
        Ok(result)
    }

    /// Dispatch on a symbolic-execution abort reason. `i` is the index of
    /// the reason line; returns the record and the cursor past it.
    fn parse_abort(&self, reason: &str, i: usize) -> Result<(AbortDetails, usize)> {
        match reason {
            "Abort due to assertion failure:" => self.abort_assertion(i),
            "Both branches aborted after a symbolic branch." => self.abort_both_branches(i),
            other => Err(self.fail(format!(
                "unknown reason for symbolic execution failure: {other}"
            ))),
        }
    }

    fn abort_assertion(&self, i: usize) -> Result<(AbortDetails, usize)> {
        let location = self.line(i + 1)?.trim().to_string();
        let category = self.line(i + 2)?.trim().to_string();

        let mut extra = Vec::new();
        let cursor = if category == "Global symbol not allocated" {
            let details_line = self.line(i + 3)?;
            if details_line.trim() != "Details:" {
                return Err(self.fail("missing Details: after global-symbol abort"));
            }
            let indent = " ".repeat(leading_whitespace(details_line) + 1);

            let mut offset = 4;
            while let Some(cursor) = self.lines.get(i + offset) {
                if !cursor.starts_with(&indent) {
                    break;
                }
                extra.push(cursor.trim().to_string());
                offset += 1;
            }
            i + offset
        } else if category == "Arithmetic comparison on incompatible values" {
            extra.push(self.line(i + 3)?.trim().to_string());
            extra.push(self.line(i + 4)?.trim().to_string());
            extra.push(self.line(i + 5)?.trim().to_string());
            i + 6
        } else if category == "Error during memory load" {
            i + 3
        } else if category.starts_with("No override specification applies for") {
            return self.abort_no_override(i, location, category);
        } else {
            return Err(self.fail(format!(
                "unknown category for symexec assertion failure: {category}"
            )));
        };

        Ok((
            AbortDetails::Assertion {
                location,
                category,
                extra,
            },
            cursor,
        ))
    }

    /// The no-override category drags in the failed override's identity
    /// and the concrete precondition error that follows it.
    fn abort_no_override(
        &self,
        i: usize,
        location: String,
        category: String,
    ) -> Result<(AbortDetails, usize)> {
        let mut extra = Vec::new();

        let mut offset = 3;
        loop {
            match self.lines.get(i + offset) {
                None => return Err(self.fail("no override preconditions marker found")),
                Some(cursor) if cursor.trim() == OVERRIDE_PRECONDITIONS => break,
                Some(_) => offset += 1,
            }
        }

        let name_line = self.line(i + offset + 1)?.trim().to_string();
        let caps = OVERRIDE_NAME_RE
            .captures(&name_line)
            .ok_or_else(|| self.fail(format!("malformed override name: {name_line}")))?;
        extra.push(caps[1].to_string());

        let loc_line = self.line(i + offset + 2)?.trim().to_string();
        let caps = OVERRIDE_LOC_RE
            .captures(&loc_line)
            .ok_or_else(|| self.fail(format!("malformed override location: {loc_line}")))?;
        extra.push(self.strip_wks(&caps[1]));

        offset += 3;
        loop {
            match self.lines.get(i + offset) {
                None => return Err(self.fail("no override error line found")),
                Some(cursor) if cursor.trim().starts_with('*') => break,
                Some(_) => offset += 1,
            }
        }

        let err_line = self.line(i + offset)?.trim().to_string();
        let caps = OVERRIDE_ERR_RE
            .captures(&err_line)
            .ok_or_else(|| self.fail(format!("malformed override error: {err_line}")))?;
        extra.push(self.strip_wks(&caps[1]));
        extra.push(caps[2].to_string());
        extra.push(self.line(i + offset + 1)?.trim().to_string());

        Ok((
            AbortDetails::Assertion {
                location,
                category,
                extra,
            },
            i + offset + 2,
        ))
    }

    fn abort_both_branches(&self, i: usize) -> Result<(AbortDetails, usize)> {
        // The branch location spans two lines.
        let location = format!("{}{}", self.line(i + 1)?.trim(), self.line(i + 2)?.trim());

        if self.line(i + 3)?.trim() != "Message from the true branch:" {
            return Err(self.fail("missing true-branch message"));
        }
        let reason_t = self.line(i + 4)?.trim().to_string();
        let (branch_t, mut pos) = self.parse_abort(&reason_t, i + 4)?;

        // Scan past the consumed true branch for the false-branch marker,
        // so the recursion never re-enters it.
        let j = loop {
            match self.lines.get(pos) {
                None => return Err(self.fail("missing false-branch message")),
                Some(cursor) if cursor.trim() == "Message from the false branch:" => break pos,
                Some(_) => pos += 1,
            }
        };

        let reason_f = self.line(j + 1)?.trim().to_string();
        let (branch_f, pos) = self.parse_abort(&reason_f, j + 1)?;

        Ok((
            AbortDetails::BothBranches {
                location,
                branch_t: Box::new(branch_t),
                branch_f: Box::new(branch_f),
            },
            pos,
        ))
    }

    /// Kind C: `Assertion made at:` lines, whose message sits above the
    /// matching `at <location>` line.
    fn search_assertion_failed(&self) -> Result<Vec<ErrorDetails>> {
        let mut result = Vec::new();

        for (i, line) in self.lines.iter().enumerate() {
            let Some(caps) = ASSERTION_RE.captures(line) else {
                continue;
            };
            let location = caps[1].to_string();
            let at_line = format!("at {location}");

            let mut found = None;
            let mut offset = 1;
            while i >= offset {
                if self.lines[i - offset] == at_line {
                    found = Some(self.line(i - offset + 1)?.to_string());
                    break;
                }
                offset += 1;
            }

            let message =
                found.ok_or_else(|| self.fail(format!("no assertion context for {location}")))?;
            result.push(ErrorDetails::AssertionFailed {
                message,
                location: self.strip_wks(&location),
            });
        }

        Ok(result)
    }

    /// Kind D: `Prover returned Unknown`, preceded by a stack trace.
    fn search_prover_unknown(&self) -> Result<Vec<ErrorDetails>> {
        let anchors: Vec<usize> = self
            .lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.as_str() == "Prover returned Unknown")
            .map(|(i, _)| i)
            .collect();

        let mut result = Vec::new();
        for i in anchors {
            let mut trace = Vec::new();
            let mut offset = 1;
            while i >= offset {
                let cursor = self.lines[i - offset].trim();
                if cursor.ends_with("Stack trace:") {
                    break;
                }
                let caps = TRACE_RE
                    .captures(cursor)
                    .ok_or_else(|| self.fail(format!("malformed stack trace entry: {cursor}")))?;
                trace.push(format!("{} @ {}", &caps[1], self.strip_wks(&caps[2])));
                offset += 1;
            }
            result.push(ErrorDetails::ProverUnknown { trace });
        }
        Ok(result)
    }
}

fn leading_whitespace(line: &str) -> usize {
    line.chars().take_while(|c| c.is_whitespace()).count()
}
