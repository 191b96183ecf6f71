use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use exif::{In, Reader, Tag};

/// Larger files are not worth opening for a timestamp.
const MAX_EXIF_FILE_SIZE: u64 = 64 * 1024 * 1024;

const DATE_TAGS: [Tag; 3] = [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime];

/// Read the capture date from a photo's EXIF block.
/// EXIF datetimes have no timezone info - they are local time as-is.
pub fn read_exif_date(path: &Path) -> Option<NaiveDateTime> {
    let file = File::open(path).ok()?;
    if file.metadata().ok()?.len() > MAX_EXIF_FILE_SIZE {
        return None;
    }
    let exif = match Reader::new().read_from_container(&mut BufReader::new(file)) {
        Ok(exif) => exif,
        Err(e) => {
            log::debug!("no EXIF in {}: {}", path.display(), e);
            return None;
        }
    };

    DATE_TAGS.iter().find_map(|tag| {
        let field = exif.get_field(*tag, In::PRIMARY)?;
        parse_exif_datetime(&field.display_value().to_string())
    })
}

/// Parse `2024:01:31 10:20:30`, tolerating the separators some cameras use.
fn parse_exif_datetime(s: &str) -> Option<NaiveDateTime> {
    let cleaned: String = s
        .trim()
        .chars()
        .map(|c| match c {
            '-' | '/' | '\\' | '.' => ':',
            other => other,
        })
        .collect();

    if let Ok(dt) = NaiveDateTime::parse_from_str(&cleaned, "%Y:%m:%d %H:%M:%S") {
        return Some(dt);
    }

    let date_part = cleaned.split(' ').next()?;
    NaiveDate::parse_from_str(date_part, "%Y:%m:%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
}
