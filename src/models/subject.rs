use chrono::{NaiveDate, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

/// The insurance agent whose carrier appointments are being verified.
///
/// Missing fields deserialize as empty strings so that validation can report
/// every problem at once instead of failing on the first absent key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct Subject {
    #[garde(length(min = 1, max = 100))]
    pub first_name: String,

    #[garde(length(min = 1, max = 100))]
    pub last_name: String,

    /// National Producer Number: 1-10 digits.
    #[garde(custom(validate_npn))]
    pub npn: String,

    /// Two-letter resident state code, e.g. "TX".
    #[garde(custom(validate_state))]
    pub resident_state: String,

    /// ISO-8601 calendar date (YYYY-MM-DD).
    #[garde(custom(validate_birth_date))]
    pub date_of_birth: String,
}

impl Subject {
    /// Identity used for deduplication, locking and rate limiting.
    pub fn key(&self) -> String {
        format!("npn:{}", self.npn.trim())
    }

    /// Run all field rules and collect every violation.
    pub fn check(&self) -> Result<(), Vec<FieldError>> {
        match self.validate() {
            Ok(()) => Ok(()),
            Err(report) => Err(report
                .iter()
                .map(|(path, error)| FieldError {
                    field: camel_case(&path.to_string()),
                    message: error.to_string(),
                })
                .collect()),
        }
    }
}

/// Field names are reported the way they appear on the wire.
fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// A single violated field in a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

fn validate_npn(value: &str, _ctx: &()) -> garde::Result {
    let npn = value.trim();
    if npn.is_empty() || npn.len() > 10 || !npn.chars().all(|c| c.is_ascii_digit()) {
        return Err(garde::Error::new("must be 1 to 10 digits"));
    }
    Ok(())
}

fn validate_state(value: &str, _ctx: &()) -> garde::Result {
    if value.len() != 2 || !value.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(garde::Error::new("must be a two-letter uppercase state code"));
    }
    Ok(())
}

fn validate_birth_date(value: &str, _ctx: &()) -> garde::Result {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| garde::Error::new("must be a date formatted YYYY-MM-DD"))?;
    if date > Utc::now().date_naive() {
        return Err(garde::Error::new("must not be in the future"));
    }
    Ok(())
}
