//! Grade and subject tags parsed from textbook file names such as
//! `SGV_KNTT_T1.pdf`, `SGK_KNTT_TA3.pdf` or `SGV_KNTT_TV5_T2.pdf`.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

const FILENAME_PATTERN: &str = r"(?i)SG[VK]_KNTT_(T[AV]?)(\d)(?:_T\d)?$";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub grade: u8,
    pub subject_code: String,
    pub subject_name: &'static str,
}

impl CatalogEntry {
    pub fn summary(&self) -> String {
        format!(
            "Grade {} - {} ({})",
            self.grade, self.subject_name, self.subject_code
        )
    }

    pub fn into_metadata(self) -> BTreeMap<String, Value> {
        let mut extra = BTreeMap::new();
        extra.insert("metadata_summary".to_string(), Value::from(self.summary()));
        extra.insert("grade".to_string(), Value::from(self.grade));
        extra.insert("subject_code".to_string(), Value::from(self.subject_code));
        extra.insert("subject_name".to_string(), Value::from(self.subject_name));
        extra
    }
}

fn subject_name(code: &str) -> Option<&'static str> {
    match code {
        "T" => Some("Toán"),
        "TA" => Some("Tiếng Anh"),
        "TV" => Some("Tiếng Việt"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct CatalogParser {
    pattern: Regex,
}

impl CatalogParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(FILENAME_PATTERN)?,
        })
    }

    pub fn parse(&self, path: &Path) -> Option<CatalogEntry> {
        let stem = path.file_stem()?.to_str()?;
        let captures = self.pattern.captures(stem)?;
        let subject_code = captures.get(1)?.as_str().to_ascii_uppercase();
        let grade = captures.get(2)?.as_str().parse::<u8>().ok()?;

        if !(1..=5).contains(&grade) {
            return None;
        }

        Some(CatalogEntry {
            grade,
            subject_name: subject_name(&subject_code)?,
            subject_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(name: &str) -> Option<CatalogEntry> {
        CatalogParser::new().expect("pattern compiles").parse(Path::new(name))
    }

    #[test]
    fn recognises_each_subject() {
        let math = parse("books/SGV_KNTT_T1.pdf").expect("math book");
        assert_eq!(math.grade, 1);
        assert_eq!(math.subject_name, "Toán");

        let english = parse("SGK_KNTT_TA3.pdf").expect("english book");
        assert_eq!(english.subject_code, "TA");
        assert_eq!(english.summary(), "Grade 3 - Tiếng Anh (TA)");

        let literature = parse("sgv_kntt_tv5_t2.pdf").expect("literature book");
        assert_eq!(literature.grade, 5);
        assert_eq!(literature.subject_code, "TV");
    }

    #[test]
    fn rejects_out_of_range_grades_and_other_names() {
        assert!(parse("SGV_KNTT_T7.pdf").is_none());
        assert!(parse("notes.txt").is_none());
        assert!(parse("SGV_KNTT_TX1.pdf").is_none());
    }
}
