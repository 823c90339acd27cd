//! Sanitized person attributes and the relational-storage seam.
//!
//! The gate never sees credentials; the web layer strips them before calling
//! in. Country-specific identity-number checksums also stay upstream, so the
//! kind field travels as an opaque string.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use facegate_core::PersonId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ProfileError {
    #[error("first name must not be blank")]
    BlankFirstName,
    #[error("last name must not be blank")]
    BlankLastName,
    #[error("email address {0:?} is not plausible")]
    BadEmail(String),
    #[error("identity number must not be blank")]
    BlankIdNumber,
    #[error("terms and conditions must be accepted")]
    TermsNotAccepted,
    #[error("date of birth {0} lies in the future")]
    FutureBirthDate(NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
    Other,
}

/// Attendee attributes handed to the relational collaborator on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub gender: Gender,
    pub date_of_birth: NaiveDate,
    pub id_number_type: String,
    pub id_number: String,
    pub accepted_terms: bool,
}

impl PersonProfile {
    /// Light structural validation. Anything country-specific (ID checksums,
    /// phone formats) is the web layer's job.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.first_name.trim().is_empty() {
            return Err(ProfileError::BlankFirstName);
        }
        if self.last_name.trim().is_empty() {
            return Err(ProfileError::BlankLastName);
        }
        if !plausible_email(&self.email) {
            return Err(ProfileError::BadEmail(self.email.clone()));
        }
        if self.id_number.trim().is_empty() {
            return Err(ProfileError::BlankIdNumber);
        }
        if !self.accepted_terms {
            return Err(ProfileError::TermsNotAccepted);
        }
        if self.date_of_birth > Utc::now().date_naive() {
            return Err(ProfileError::FutureBirthDate(self.date_of_birth));
        }
        Ok(())
    }
}

/// One '@' with a non-empty local part and a dotted domain.
fn plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.contains('.')
        && !domain.contains('@')
}

#[derive(Error, Debug)]
#[error("person sink: {0}")]
pub struct SinkError(pub String);

/// Relational-storage collaborator. A committed person row and a committed
/// biometric record form one logical unit; a sink failure rolls the
/// biometric side back.
#[async_trait]
pub trait PersonSink: Send + Sync {
    async fn commit_person(&self, person: PersonId, profile: &PersonProfile)
        -> Result<(), SinkError>;

    async fn delete_person(&self, person: PersonId) -> Result<(), SinkError>;
}

/// Sink for deployments where the relational side lives elsewhere
/// (operator CLI, tests).
pub struct NullSink;

#[async_trait]
impl PersonSink for NullSink {
    async fn commit_person(
        &self,
        person: PersonId,
        _profile: &PersonProfile,
    ) -> Result<(), SinkError> {
        tracing::debug!(%person, "null sink: person accepted");
        Ok(())
    }

    async fn delete_person(&self, person: PersonId) -> Result<(), SinkError> {
        tracing::debug!(%person, "null sink: person deleted");
        Ok(())
    }
}
