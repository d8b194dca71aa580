//! Identity of the signed-in user.
//!
//! The engine never refreshes tokens. It only asks whether a user is signed
//! in and stamps the user and organization ids onto what it sends.

use parking_lot::RwLock;

/// Metadata key carrying the user id.
pub const USER_ID_KEY: &str = "user_id";
/// Metadata key carrying the organization id.
pub const ORGANIZATION_ID_KEY: &str = "organization_id";

/// Read-only view of the current session.
pub trait AuthContext: Send + Sync + 'static {
    /// Returns true if a user is signed in.
    fn is_authenticated(&self) -> bool;

    /// Returns the signed-in user's id.
    fn user_id(&self) -> Option<String>;

    /// Returns the user's organization id.
    fn organization_id(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default)]
struct Session {
    user_id: Option<String>,
    organization_id: Option<String>,
}

/// An auth context whose session is set by hand.
#[derive(Debug, Default)]
pub struct StaticAuth {
    session: RwLock<Session>,
}

impl StaticAuth {
    /// Creates a context with nobody signed in.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Creates a context with `user_id` signed in.
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        let auth = Self::default();
        auth.sign_in(user_id, None);
        auth
    }

    /// Sets the organization.
    pub fn with_organization(self, organization_id: impl Into<String>) -> Self {
        self.session.write().organization_id = Some(organization_id.into());
        self
    }

    /// Signs a user in.
    pub fn sign_in(&self, user_id: impl Into<String>, organization_id: Option<String>) {
        *self.session.write() = Session {
            user_id: Some(user_id.into()),
            organization_id,
        };
    }

    /// Signs the user out.
    pub fn sign_out(&self) {
        *self.session.write() = Session::default();
    }
}

impl AuthContext for StaticAuth {
    fn is_authenticated(&self) -> bool {
        self.session.read().user_id.is_some()
    }

    fn user_id(&self) -> Option<String> {
        self.session.read().user_id.clone()
    }

    fn organization_id(&self) -> Option<String> {
        self.session.read().organization_id.clone()
    }
}
