//! Close-event journal.

mod journal;

pub use journal::{CloseJournal, JournalEntry};
