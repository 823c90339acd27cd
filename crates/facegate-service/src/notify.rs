//! Registration notification seam.
//!
//! Fired after a commit as a detached side effect. Delivery failure is
//! logged and never affects the registration outcome; transport and
//! templating live with the collaborator.

use crate::person::PersonProfile;
use async_trait::async_trait;
use facegate_core::PersonId;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("notifier: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait RegistrationNotifier: Send + Sync {
    async fn registration_committed(
        &self,
        person: PersonId,
        profile: &PersonProfile,
    ) -> Result<(), NotifyError>;
}

/// Default notifier: does nothing.
pub struct NullNotifier;

#[async_trait]
impl RegistrationNotifier for NullNotifier {
    async fn registration_committed(
        &self,
        _person: PersonId,
        _profile: &PersonProfile,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}
