//! Flood event windows from an EM-DAT export, and which of them still need a
//! composite.

use std::collections::BTreeSet;
use std::io::Read;

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use log::{debug, info, warn};
use regex::Regex;

use crate::error::{ChipError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FloodEvent {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl FloodEvent {
    /// Name prefix of the composite exported for this event.
    pub fn composite_prefix(&self) -> String {
        format!("input_data_{}", self.start.format("%Y-%m-%d"))
    }
}

/// Events for `country` (case-insensitive) in table order. Rows with a
/// missing or invalid start or end date are logged and dropped.
pub fn read_flood_events<R: Read>(reader: R, country: &str) -> Result<Vec<FloodEvent>> {
    let mut rdr = ReaderBuilder::new().trim(Trim::All).flexible(true).from_reader(reader);
    let headers = rdr.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ChipError::EventTable(format!("missing column {:?}", name)))
    };
    let country_col = column("Country")?;
    let start_cols = [column("Start Year")?, column("Start Month")?, column("Start Day")?];
    let end_cols = [column("End Year")?, column("End Month")?, column("End Day")?];

    let wanted = country.trim().to_lowercase();
    let mut events = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record?;
        if record.get(country_col).map(str::to_lowercase).as_deref() != Some(wanted.as_str()) {
            continue;
        }
        match (date_from(&record, start_cols), date_from(&record, end_cols)) {
            (Some(start), Some(end)) => events.push(FloodEvent { start, end }),
            (start, _) => warn!(
                "country={} row {}: invalid {} date, dropped",
                country,
                row + 2,
                if start.is_none() { "start" } else { "end" }
            ),
        }
    }
    info!("country={} => {} flood events", country, events.len());
    Ok(events)
}

/// Spreadsheet exports write integer parts as `2020` or `2020.0`.
fn date_from(record: &StringRecord, cols: [usize; 3]) -> Option<NaiveDate> {
    let part = |i: usize| -> Option<i64> {
        let v: f64 = record.get(cols[i])?.parse().ok()?;
        (v.fract() == 0.0).then_some(v as i64)
    };
    NaiveDate::from_ymd_opt(
        i32::try_from(part(0)?).ok()?,
        u32::try_from(part(1)?).ok()?,
        u32::try_from(part(2)?).ok()?,
    )
}

/// First `YYYY-MM-DD` found in each name.
pub fn existing_event_dates<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<BTreeSet<NaiveDate>> {
    let re = Regex::new(r"\d{4}-\d{2}-\d{2}")?;
    let mut dates = BTreeSet::new();
    for name in names {
        let Some(m) = re.find(name) else { continue };
        match NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d") {
            Ok(d) => {
                dates.insert(d);
            }
            Err(_) => debug!("{}: {} is not a calendar date", name, m.as_str()),
        }
    }
    Ok(dates)
}

/// Events whose start date has no composite yet.
pub fn pending_events(events: &[FloodEvent], existing: &BTreeSet<NaiveDate>) -> Vec<FloodEvent> {
    events
        .iter()
        .filter(|e| {
            let done = existing.contains(&e.start);
            if done {
                info!("Skipping {}: data already exist", e.start);
            }
            !done
        })
        .copied()
        .collect()
}
