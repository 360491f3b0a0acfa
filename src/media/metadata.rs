use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::DateExtractor;
use crate::db::DateSource;

const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Reads `DateTimeOriginal` (then `DateTime`) from EXIF, falling back to the file mtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifDateExtractor;

impl DateExtractor for ExifDateExtractor {
    fn extract_date(&self, path: &Path, mtime: DateTime<Utc>) -> (DateTime<Utc>, DateSource) {
        match read_exif_date(path) {
            Some(taken) => (taken, DateSource::Exif),
            None => (mtime, DateSource::Mtime),
        }
    }
}

fn read_exif_date(path: &Path) -> Option<DateTime<Utc>> {
    let file = File::open(path).ok()?;
    let mut bufreader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut bufreader).ok()?;

    [exif::Tag::DateTimeOriginal, exif::Tag::DateTime]
        .iter()
        .filter_map(|tag| exif.get_field(*tag, exif::In::PRIMARY))
        .find_map(|field| match field.value {
            exif::Value::Ascii(ref parts) => parts
                .first()
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(parse_exif_date),
            _ => None,
        })
}

/// EXIF dates carry no zone; they are taken as UTC.
pub fn parse_exif_date(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim().trim_matches('"').trim_end_matches('\0');
    NaiveDateTime::parse_from_str(trimmed, EXIF_DATE_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}
