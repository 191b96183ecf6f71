//! Output names for a resolved plan.
//!
//! Formatting is a pure function of the plan, the options and the set of
//! names already taken in the output folder: the same inputs always give the
//! same names.

use std::collections::HashSet;
use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::media::{MediaFile, MediaKind};
use crate::plan::{MatchGroup, MatchPlan};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum NamingTemplate {
    /// `001`
    #[default]
    Sequence,
    /// `CHANG_CHIA_HAO_001`, from the caption on the anchor photo
    NameSequence,
    /// `20240131_001`, from the group's capture date
    DateSequence,
    /// `<prefix>_001`
    PrefixSequence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingOptions {
    pub template: NamingTemplate,
    pub pad_width: usize,
    pub prefix: Option<String>,
}

impl Default for NamingOptions {
    fn default() -> Self {
        Self {
            template: NamingTemplate::Sequence,
            pad_width: 3,
            prefix: None,
        }
    }
}

impl NamingOptions {
    pub fn validate(&self) -> Result<()> {
        if self.pad_width == 0 {
            return Err(Error::InvalidConfig("pad_width must be at least 1".into()));
        }
        Ok(())
    }

    pub fn needs_names(&self) -> bool {
        self.template == NamingTemplate::NameSequence
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub source: PathBuf,
    pub file_name: String,
    /// Index into `MatchPlan::groups`
    pub group_index: usize,
    pub kind: MediaKind,
    pub capture_timestamp: Option<chrono::NaiveDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputAssignment {
    /// Group order, anchor before videos
    pub entries: Vec<OutputEntry>,
    /// Groups named with `sequence` although another template was asked for
    pub fallbacks: Vec<usize>,
}

impl OutputAssignment {
    pub fn for_group(&self, group_index: usize) -> impl Iterator<Item = &OutputEntry> + '_ {
        self.entries.iter().filter(move |e| e.group_index == group_index)
    }
}

/// Suffix for the `index`-th video of a group: `a`..`z`, `aa`, `ab`, ...
pub fn suffix_letters(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        n -= 1;
        letters.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

/// Characters that cannot appear in a file name on common platforms.
fn sanitize(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Base name of a group before collision handling; `None` means the
/// template could not be applied and `sequence` is used.
fn template_base(group: &MatchGroup, seq: &str, options: &NamingOptions) -> Option<String> {
    match options.template {
        NamingTemplate::Sequence => Some(seq.to_string()),
        NamingTemplate::NameSequence => group
            .extracted_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(|name| format!("{}_{seq}", sanitize(name))),
        NamingTemplate::DateSequence => group
            .capture_timestamp()
            .map(|ts| format!("{}_{seq}", ts.format("%Y%m%d"))),
        NamingTemplate::PrefixSequence => options
            .prefix
            .as_deref()
            .map(sanitize)
            .filter(|p| !p.is_empty())
            .map(|prefix| format!("{prefix}_{seq}")),
    }
}

fn with_ext(stem: &str, file: &MediaFile) -> String {
    let ext = file.extension();
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}

fn file_names(base: &str, group: &MatchGroup) -> Vec<String> {
    let mut names = Vec::with_capacity(group.len());
    if let Some(anchor) = &group.anchor {
        names.push(with_ext(base, anchor));
    }
    let suffixed = group.videos.len() > 1;
    for (i, video) in group.videos.iter().enumerate() {
        let stem = if suffixed {
            format!("{base}{}", suffix_letters(i))
        } else {
            base.to_string()
        };
        names.push(with_ext(&stem, video));
    }
    names
}

/// Names the writer gives the parts of a split video. Only the lone video
/// of a group is split.
fn split_part_names(base: &str, group: &MatchGroup, split_segments: u8) -> Vec<String> {
    match group.videos.as_slice() {
        [video] if split_segments > 1 => (0..usize::from(split_segments))
            .map(|i| with_ext(&format!("{base}{}", suffix_letters(i)), video))
            .collect(),
        _ => Vec::new(),
    }
}

/// Assign output names to every confident group of `plan`. `reserved` are
/// names already present in the output folder. With `split_segments > 1`
/// the part names of split videos must be free as well.
pub fn format_plan(
    plan: &MatchPlan,
    options: &NamingOptions,
    reserved: &HashSet<String>,
    split_segments: u8,
) -> OutputAssignment {
    let mut used: HashSet<String> = reserved.iter().map(|n| n.to_lowercase()).collect();
    let mut assignment = OutputAssignment::default();
    let pad = options.pad_width.max(1);

    for (index, group) in plan.groups.iter().enumerate() {
        let seq = format!("{:0pad$}", index + 1);
        let base = match template_base(group, &seq, options) {
            Some(base) => base,
            None => {
                assignment.fallbacks.push(index);
                seq.clone()
            }
        };

        let mut counter = 0u32;
        let names = loop {
            let candidate = if counter == 0 {
                base.clone()
            } else {
                format!("{base}({counter})")
            };
            let names = file_names(&candidate, group);
            let parts = split_part_names(&candidate, group, split_segments);
            if names.iter().chain(&parts).all(|n| !used.contains(&n.to_lowercase())) {
                used.extend(parts.iter().map(|n| n.to_lowercase()));
                break names;
            }
            counter += 1;
        };
        if counter > 0 {
            log::debug!("group {} renamed to avoid a collision with {}", index + 1, base);
        }

        for (file, file_name) in group.files().zip(names) {
            used.insert(file_name.to_lowercase());
            assignment.entries.push(OutputEntry {
                source: file.path.clone(),
                file_name,
                group_index: index,
                kind: file.kind,
                capture_timestamp: file.capture_timestamp,
            });
        }
    }
    assignment
}
