use super::Event;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

/// A single line of a digest.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DigestEntry {
    pub name: String,
    pub time_range: String,
    pub location: String,
}

impl From<&Event> for DigestEntry {
    fn from(event: &Event) -> Self {
        let start_time = event.start.format("%H:%M");

        let end_time = if event.start.date_naive() == event.end.date_naive() {
            // Single-day event, just format the end time.
            event.end.format("%H:%M")
        } else {
            // Multi-day event, format end date and time.
            event.end.format("%d/%m %H:%M")
        };

        DigestEntry {
            name: event.summary.clone(),
            time_range: format!("{start_time} - {end_time}"),
            location: event.location.clone(),
        }
    }
}

/// The summary of a channel's day as sent to a destination.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub title: String,
    pub entries: Vec<DigestEntry>,
    pub is_empty: bool,
}

impl Digest {
    /// Builds the digest of `day` from its events.
    pub fn new(day: NaiveDate, events: &[Event]) -> Digest {
        Digest {
            title: format!("Agenda for {}", day.format("%A %d/%m/%Y")),
            entries: events.iter().map(Into::into).collect(),
            is_empty: events.is_empty(),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.title)?;

        if self.is_empty {
            return writeln!(f, "Nothing scheduled");
        }

        for entry in &self.entries {
            writeln!(f)?;
            writeln!(f, "{}", entry.name)?;
            writeln!(f, "{}", entry.time_range)?;
            if !entry.location.is_empty() {
                writeln!(f, "{}", entry.location)?;
            }
        }

        Ok(())
    }
}
