//! Output data model: discrete notes produced by the decode stage.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KeyscribeError, Result};

/// MIDI note number of piano key index 0 (A0).
///
/// `Note::pitch` stays a key index; consumers apply this offset when emitting MIDI.
pub const PIANO_MIDI_OFFSET: u8 = 21;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// One decoded note. Times are seconds relative to the start of its analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pitch: u8,
    start_time: f64,
    end_time: f64,
    velocity: u8,
}

impl Note {
    /// Build a note, rejecting empty spans and out-of-range pitch/velocity.
    pub fn new(pitch: u8, start_time: f64, end_time: f64, velocity: u8) -> Result<Self> {
        if pitch > 127 {
            return Err(KeyscribeError::InvalidNote(format!("pitch {pitch} > 127")));
        }
        if velocity > 127 {
            return Err(KeyscribeError::InvalidNote(format!(
                "velocity {velocity} > 127"
            )));
        }
        if !(end_time > start_time) {
            return Err(KeyscribeError::InvalidNote(format!(
                "end {end_time} is not after start {start_time}"
            )));
        }
        Ok(Self {
            pitch,
            start_time,
            end_time,
            velocity,
        })
    }

    pub fn pitch(&self) -> u8 {
        self.pitch
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    pub fn velocity(&self) -> u8 {
        self.velocity
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Absolute MIDI note number, assuming `pitch` is a piano key index.
    pub fn midi_pitch(&self) -> u8 {
        self.pitch.saturating_add(PIANO_MIDI_OFFSET).min(127)
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let midi = self.pitch as i32 + PIANO_MIDI_OFFSET as i32;
        let name = NOTE_NAMES[(midi % 12) as usize];
        let octave = midi / 12 - 1;
        write!(
            f,
            "{name}{octave} vel={} [{:.3}s, {:.3}s)",
            self.velocity, self.start_time, self.end_time
        )
    }
}

/// Notes in the order the segmenter closed them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteSequence {
    notes: Vec<Note>,
}

impl NoteSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, note: Note) {
        self.notes.push(note);
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Note> {
        self.notes.iter()
    }

    pub fn as_slice(&self) -> &[Note] {
        &self.notes
    }

    pub fn into_vec(self) -> Vec<Note> {
        self.notes
    }

    /// Stable sort by start time. The segmenter emits in closing order, which
    /// interleaves pitches; consumers that need onset order call this.
    pub fn sort_by_onset(&mut self) {
        self.notes
            .sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
    }
}

impl From<Vec<Note>> for NoteSequence {
    fn from(notes: Vec<Note>) -> Self {
        Self { notes }
    }
}

impl IntoIterator for NoteSequence {
    type Item = Note;
    type IntoIter = std::vec::IntoIter<Note>;

    fn into_iter(self) -> Self::IntoIter {
        self.notes.into_iter()
    }
}

impl<'a> IntoIterator for &'a NoteSequence {
    type Item = &'a Note;
    type IntoIter = std::slice::Iter<'a, Note>;

    fn into_iter(self) -> Self::IntoIter {
        self.notes.iter()
    }
}
