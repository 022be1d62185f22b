//! JSONL journal of close decisions, one file per day.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info};

/// Journal entry types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum JournalEntry {
    #[serde(rename = "session_start")]
    SessionStart {
        timestamp: DateTime<Utc>,
        version: String,
    },
    #[serde(rename = "session_end")]
    SessionEnd {
        timestamp: DateTime<Utc>,
        closes_emitted: u64,
    },
    #[serde(rename = "close_emitted")]
    CloseEmitted {
        timestamp: DateTime<Utc>,
        skill_idle_event_id: Option<String>,
    },
}

/// JSONL journal writer for close decisions.
pub struct CloseJournal {
    journal_dir: PathBuf,
    current_file: Option<BufWriter<File>>,
    current_date: Option<String>,
    closes_emitted: u64,
}

impl CloseJournal {
    /// Create a new journal writing under `journal_dir`.
    pub fn new(journal_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&journal_dir)
            .with_context(|| format!("Failed to create journal directory: {:?}", journal_dir))?;

        Ok(Self {
            journal_dir,
            current_file: None,
            current_date: None,
            closes_emitted: 0,
        })
    }

    /// Get or create the journal file for today.
    fn get_writer(&mut self) -> Result<&mut BufWriter<File>> {
        let today = Local::now().format("%Y-%m-%d").to_string();

        // Check if we need to rotate to a new file
        if self.current_date.as_ref() != Some(&today) {
            let journal_path = self.journal_dir.join(format!("{}.jsonl", today));

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&journal_path)
                .with_context(|| format!("Failed to open journal file: {:?}", journal_path))?;

            self.current_file = Some(BufWriter::new(file));
            self.current_date = Some(today.clone());

            debug!("Opened journal file: {:?}", journal_path);
        }

        self.current_file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No journal file available"))
    }

    /// Write a line to the journal.
    fn write_line(&mut self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let writer = self.get_writer()?;
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }

    /// Journal session start.
    pub fn log_session_start(&mut self, version: &str) -> Result<()> {
        let entry = JournalEntry::SessionStart {
            timestamp: Utc::now(),
            version: version.to_string(),
        };
        info!("Session started");
        self.write_line(&entry)
    }

    /// Journal session end.
    pub fn log_session_end(&mut self) -> Result<()> {
        let entry = JournalEntry::SessionEnd {
            timestamp: Utc::now(),
            closes_emitted: self.closes_emitted,
        };
        info!("Session ended, {} close events emitted", self.closes_emitted);
        self.write_line(&entry)
    }

    /// Journal one emitted `screen_close_idle` event.
    pub fn log_close(&mut self, skill_idle_event_id: Option<&str>) -> Result<()> {
        self.closes_emitted += 1;
        let entry = JournalEntry::CloseEmitted {
            timestamp: Utc::now(),
            skill_idle_event_id: skill_idle_event_id.map(str::to_string),
        };
        self.write_line(&entry)
    }
}

impl Drop for CloseJournal {
    fn drop(&mut self) {
        // Flush any remaining data
        if let Some(ref mut writer) = self.current_file {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_entries(dir: &std::path::Path) -> Vec<JournalEntry> {
        let mut entries = Vec::new();
        for file in std::fs::read_dir(dir).unwrap() {
            let content = std::fs::read_to_string(file.unwrap().path()).unwrap();
            for line in content.lines() {
                entries.push(serde_json::from_str(line).unwrap());
            }
        }
        entries
    }

    #[test]
    fn journal_records_session_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = CloseJournal::new(dir.path().to_path_buf()).unwrap();

        journal.log_session_start("0.1.0").unwrap();
        journal.log_close(Some("weather-skill")).unwrap();
        journal.log_close(None).unwrap();
        journal.log_session_end().unwrap();

        let entries = read_entries(dir.path());
        assert_eq!(entries.len(), 4);
        assert!(matches!(&entries[0], JournalEntry::SessionStart { version, .. } if version == "0.1.0"));
        assert!(matches!(
            &entries[1],
            JournalEntry::CloseEmitted { skill_idle_event_id: Some(id), .. } if id == "weather-skill"
        ));
        assert!(matches!(
            &entries[2],
            JournalEntry::CloseEmitted { skill_idle_event_id: None, .. }
        ));
        assert!(matches!(
            &entries[3],
            JournalEntry::SessionEnd { closes_emitted: 2, .. }
        ));
    }

    #[test]
    fn new_creates_the_journal_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/journal");
        CloseJournal::new(nested.clone()).unwrap();
        assert!(nested.is_dir());
    }
}
