//! CRM export parsing into [`CanonicalContact`] rows.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use bcr_core::{normalize_email, CanonicalContact, UNKNOWN_NAME};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)+$",
    )
    .expect("email pattern compiles")
});

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%d.%m.%Y", "%b %d, %Y", "%d %b %Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("cannot read {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot read header row: {0}")]
    Header(#[source] csv::Error),
    #[error("no email column among headers: {0}")]
    MissingEmailColumn(String),
    #[error("csv reader task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    Email,
    FirstName,
    LastName,
    FullName,
    Phone,
    Company,
    Tags,
    Created,
    LastActivity,
}

fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn column_for(header: &str) -> Option<Column> {
    let column = match normalize_header(header).as_str() {
        "email" | "e mail" | "email address" | "primary email" | "work email" => Column::Email,
        "first name" | "firstname" | "given name" => Column::FirstName,
        "last name" | "lastname" | "surname" | "family name" => Column::LastName,
        "name" | "full name" | "contact name" => Column::FullName,
        "phone" | "phone number" | "mobile" | "mobile phone" | "telephone" => Column::Phone,
        "company" | "company name" | "business" | "business name" | "organization" => {
            Column::Company
        }
        "tags" | "tag" | "contact tags" => Column::Tags,
        "created" | "created on" | "created at" | "created date" | "date created" => {
            Column::Created
        }
        "last activity" | "last activity date" | "last activity on" | "last active" => {
            Column::LastActivity
        }
        _ => return None,
    };
    Some(column)
}

/// RFC-shaped address check on an already normalized email.
pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && EMAIL_RE.is_match(email)
}

/// Best-effort calendar date; anything unrecognised yields `None`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub contacts: Vec<CanonicalContact>,
    pub short_rows: usize,
    pub invalid_emails: usize,
    pub unreadable_rows: usize,
}

impl IngestOutcome {
    /// Distinct normalized emails among the parsed contacts.
    pub fn unique_emails(&self) -> usize {
        let mut seen = std::collections::HashSet::new();
        self.contacts
            .iter()
            .filter(|c| seen.insert(c.email.as_str()))
            .count()
    }
}

fn field<'r>(record: &'r csv::StringRecord, columns: &HashMap<Column, usize>, col: Column) -> Option<&'r str> {
    columns
        .get(&col)
        .and_then(|&idx| record.get(idx))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parse an export held in memory.
pub fn parse_contacts(bytes: &[u8]) -> Result<IngestOutcome, IngestError> {
    parse_reader(bytes)
}

/// Parse rows as they are read; only the header and the kept contacts are held.
pub fn parse_reader<R: Read>(input: R) -> Result<IngestOutcome, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let headers = reader.headers().map_err(IngestError::Header)?.clone();
    let mut columns = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        if let Some(col) = column_for(header) {
            columns.entry(col).or_insert(idx);
        }
    }
    if !columns.contains_key(&Column::Email) {
        return Err(IngestError::MissingEmailColumn(
            headers.iter().collect::<Vec<_>>().join(", "),
        ));
    }

    let mut outcome = IngestOutcome::default();
    let mut record = csv::StringRecord::new();
    let mut row_no = 1usize;
    loop {
        row_no += 1;
        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) if err.is_io_error() => {
                debug!(row = row_no, error = %err, "csv stream ended early");
                outcome.unreadable_rows += 1;
                break;
            }
            Err(err) => {
                debug!(row = row_no, error = %err, "unreadable csv row skipped");
                outcome.unreadable_rows += 1;
                continue;
            }
        }
        if record.len() < headers.len() {
            outcome.short_rows += 1;
            continue;
        }

        let email = normalize_email(field(&record, &columns, Column::Email).unwrap_or_default());
        if !is_valid_email(&email) {
            outcome.invalid_emails += 1;
            continue;
        }

        let first = field(&record, &columns, Column::FirstName).unwrap_or_default();
        let last = field(&record, &columns, Column::LastName).unwrap_or_default();
        let name = match format!("{first} {last}").trim() {
            "" => field(&record, &columns, Column::FullName)
                .unwrap_or(UNKNOWN_NAME)
                .to_string(),
            joined => joined.to_string(),
        };

        outcome.contacts.push(CanonicalContact {
            name,
            email,
            phone: field(&record, &columns, Column::Phone).map(str::to_string),
            company: field(&record, &columns, Column::Company).map(str::to_string),
            tags: field(&record, &columns, Column::Tags).map(str::to_string),
            created_on: field(&record, &columns, Column::Created).and_then(parse_date),
            last_activity_on: field(&record, &columns, Column::LastActivity).and_then(parse_date),
        });
    }
    Ok(outcome)
}

/// Stream an export file from disk on the blocking pool. Only an unreadable
/// file or header aborts.
pub async fn read_contacts(path: impl AsRef<Path>) -> Result<IngestOutcome, IngestError> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = File::open(&path).map_err(|source| IngestError::Open {
            path: path.clone(),
            source,
        })?;
        parse_reader(file)
    })
    .await
    .map_err(|err| IngestError::Task(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_variants_are_case_insensitive() {
        let csv = "\u{feff}E-Mail,FIRST_NAME,Last Name,Business Name,Phone Number,Tags,Created On,Last Activity Date\n\
                   Alice@X.com ,Alice,Example,Acme,555-1234,plan_annual,2024-03-01,03/15/2024\n";
        let outcome = parse_contacts(csv.as_bytes()).unwrap();
        assert_eq!(outcome.contacts.len(), 1);
        let c = &outcome.contacts[0];
        assert_eq!(c.email, "alice@x.com");
        assert_eq!(c.name, "Alice Example");
        assert_eq!(c.company.as_deref(), Some("Acme"));
        assert_eq!(c.phone.as_deref(), Some("555-1234"));
        assert_eq!(c.tags.as_deref(), Some("plan_annual"));
        assert_eq!(c.created_on, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(c.last_activity_on, NaiveDate::from_ymd_opt(2024, 3, 15));
    }

    #[test]
    fn invalid_and_short_rows_are_dropped() {
        let csv = "Email,First Name,Last Name,Created\n\
                   good@x.com,,,yesterday\n\
                   not-an-email,Bad,Row,\n\
                   short@x.com,Too\n\
                   ,Blank,Email,\n";
        let outcome = parse_contacts(csv.as_bytes()).unwrap();
        assert_eq!(outcome.contacts.len(), 1);
        assert_eq!(outcome.contacts[0].name, UNKNOWN_NAME);
        assert_eq!(outcome.contacts[0].created_on, None);
        assert_eq!(outcome.short_rows, 1);
        assert_eq!(outcome.invalid_emails, 2);
    }

    #[test]
    fn full_name_column_is_a_fallback() {
        let csv = "email,name\nzed@x.io,Zed Zulu\n";
        let outcome = parse_contacts(csv.as_bytes()).unwrap();
        assert_eq!(outcome.contacts[0].name, "Zed Zulu");
    }

    #[test]
    fn missing_email_column_is_an_error() {
        let err = parse_contacts(b"Name,Phone\nA,1\n").unwrap_err();
        assert!(matches!(err, IngestError::MissingEmailColumn(_)));
    }

    #[test]
    fn duplicates_count_once() {
        let csv = "Email\na@x.com\nA@X.com\nb@x.com\n";
        let outcome = parse_contacts(csv.as_bytes()).unwrap();
        assert_eq!(outcome.contacts.len(), 3);
        assert_eq!(outcome.unique_emails(), 2);
    }

    #[test]
    fn email_shape() {
        assert!(is_valid_email("first.last+tag@sub.example.co"));
        assert!(!is_valid_email("no-at-sign.com"));
        assert!(!is_valid_email("two@@x.com"));
        assert!(!is_valid_email("nodot@localhost"));
        assert!(!is_valid_email("spaces in@x.com"));
    }

    #[test]
    fn dates_are_best_effort() {
        assert_eq!(parse_date("2024-01-31T10:00:00Z"), NaiveDate::from_ymd_opt(2024, 1, 31));
        assert_eq!(parse_date("2024-01-31 08:15:00"), NaiveDate::from_ymd_opt(2024, 1, 31));
        assert_eq!(parse_date("Jan 31, 2024"), NaiveDate::from_ymd_opt(2024, 1, 31));
        assert_eq!(parse_date("31/31/2024"), None);
        assert_eq!(parse_date(""), None);
    }

    #[tokio::test]
    async fn file_is_streamed_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.csv");
        let mut csv = String::from("Email,First Name\n");
        for i in 0..5_000 {
            csv.push_str(&format!("user{i}@x.com,User\n"));
        }
        csv.push_str("broken,Row\n");
        std::fs::write(&path, csv).unwrap();

        let outcome = read_contacts(&path).await.unwrap();

        assert_eq!(outcome.contacts.len(), 5_000);
        assert_eq!(outcome.contacts[4_999].email, "user4999@x.com");
        assert_eq!(outcome.invalid_emails, 1);
    }

    #[tokio::test]
    async fn unreadable_file_aborts() {
        let err = read_contacts("/definitely/not/here.csv").await.unwrap_err();
        assert!(matches!(err, IngestError::Open { .. }));
    }
}
