//! Recipient and sender address policy.
//!
//! The session consults an [`AddressPolicy`] to validate envelope addresses
//! and to decide, per recipient, whether the message should actually be
//! stored. This crate ships two policies so the server runs standalone:
//! [`PermissiveAddressPolicy`] accepts anything syntactically sound, and
//! [`DomainAddressPolicy`] additionally restricts recipients to an allowed
//! set of domains. A deployment wanting directory-backed validation
//! implements its own [`AddressPolicy`].

use std::collections::HashSet;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("address syntax invalid")]
    BadSyntax,
    #[error("domain not accepted")]
    DomainRejected,
}

/// The policy's decorated view of a RCPT address: the raw address, its
/// local part, and whether the session should actually persist mail for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    address: String,
    local_part: String,
    should_store: bool,
}

impl Recipient {
    pub fn new(address: String, local_part: String, should_store: bool) -> Self {
        Self {
            address,
            local_part,
            should_store,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    pub fn should_store(&self) -> bool {
        self.should_store
    }
}

/// Validates and classifies envelope addresses.
///
/// Implementations are consulted read-only from every session task; they
/// must be `Send + Sync` and safe to share behind an `Arc`.
pub trait AddressPolicy: Send + Sync {
    /// Validates a MAIL FROM address, returning its local part and domain
    /// (domain may be empty for a local-only address such as `postmaster`).
    fn parse_email_address(&self, text: &str) -> Result<(String, String), PolicyError>;

    /// Constructs a decorated [`Recipient`] from a RCPT TO address, or
    /// rejects it outright.
    fn new_recipient(&self, text: &str) -> Result<Recipient, PolicyError>;
}

/// Splits `local@domain`, tolerating a bare local part with no `@` at all
/// (e.g. `postmaster`), matching RFC 821 local addressing.
fn split_address(text: &str) -> Result<(String, String), PolicyError> {
    if text.is_empty() || text.contains(char::is_whitespace) {
        return Err(PolicyError::BadSyntax);
    }
    match text.rsplit_once('@') {
        Some((local, domain)) => {
            if local.is_empty() || domain.is_empty() {
                return Err(PolicyError::BadSyntax);
            }
            Ok((local.to_string(), domain.to_string()))
        }
        None => Ok((text.to_string(), String::new())),
    }
}

/// Accepts any syntactically valid address and always stores it. The
/// default policy so the server is runnable without configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveAddressPolicy;

impl AddressPolicy for PermissiveAddressPolicy {
    fn parse_email_address(&self, text: &str) -> Result<(String, String), PolicyError> {
        split_address(text)
    }

    fn new_recipient(&self, text: &str) -> Result<Recipient, PolicyError> {
        let (local, _domain) = split_address(text)?;
        Ok(Recipient::new(text.to_string(), local, true))
    }
}

/// Restricts recipients to a configured set of accepted domains (case
/// folded), storing mail only for addresses whose domain is in the set.
/// Addresses for other domains are rejected at RCPT TO rather than merely
/// not stored, matching the "decline early" posture of admission policies
/// in this space.
#[derive(Debug, Clone)]
pub struct DomainAddressPolicy {
    accepted_domains: HashSet<String>,
}

impl DomainAddressPolicy {
    pub fn new(accepted_domains: HashSet<String>) -> Self {
        Self {
            accepted_domains: accepted_domains
                .into_iter()
                .map(|d| d.to_lowercase())
                .collect(),
        }
    }
}

impl AddressPolicy for DomainAddressPolicy {
    fn parse_email_address(&self, text: &str) -> Result<(String, String), PolicyError> {
        split_address(text)
    }

    fn new_recipient(&self, text: &str) -> Result<Recipient, PolicyError> {
        let (local, domain) = split_address(text)?;
        if domain.is_empty() || !self.accepted_domains.contains(&domain.to_lowercase()) {
            return Err(PolicyError::DomainRejected);
        }
        Ok(Recipient::new(text.to_string(), local, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_accepts_local_and_domain_addresses() {
        let policy = PermissiveAddressPolicy;
        assert!(policy.new_recipient("user@example.com").is_ok());
        assert!(policy.new_recipient("postmaster").is_ok());
    }

    #[test]
    fn permissive_rejects_empty_or_whitespace() {
        let policy = PermissiveAddressPolicy;
        assert_eq!(policy.new_recipient("").unwrap_err(), PolicyError::BadSyntax);
        assert!(policy.new_recipient("has space@example.com").is_err());
    }

    #[test]
    fn domain_policy_accepts_listed_domain_only() {
        let policy = DomainAddressPolicy::new(["example.com".to_string()].into_iter().collect());
        assert!(policy.new_recipient("user@example.com").is_ok());
        assert_eq!(
            policy.new_recipient("user@evil.com").unwrap_err(),
            PolicyError::DomainRejected
        );
    }

    #[test]
    fn domain_policy_rejects_local_only_address() {
        let policy = DomainAddressPolicy::new(["example.com".to_string()].into_iter().collect());
        assert_eq!(
            policy.new_recipient("postmaster").unwrap_err(),
            PolicyError::DomainRejected
        );
    }

    #[test]
    fn recipient_exposes_should_store_and_local_part() {
        let r = Recipient::new("user@example.com".to_string(), "user".to_string(), true);
        assert_eq!(r.address(), "user@example.com");
        assert_eq!(r.local_part(), "user");
        assert!(r.should_store());
    }
}
