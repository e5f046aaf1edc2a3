//! Address normalization and accept/store policy
//!
//! Every envelope address is reduced to a canonical mailbox name by the
//! configured naming mode. The ingress consults the policy once per
//! RCPT TO; the manager consults it again per recipient at delivery
//! time, so re-routed recipients are caught after normalization.

use std::str::FromStr;

use crate::error::{Error, Result};

/// How a recipient address maps to a mailbox name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailboxNaming {
    /// Strip the domain: `bob@example.com` -> `bob`.
    #[default]
    Local,
    /// Entire address, lowercased: `Bob@Example.Com` -> `bob@example.com`.
    Full,
    /// Domain only: `bob@example.com` -> `example.com`.
    Domain,
}

impl FromStr for MailboxNaming {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "full" => Ok(Self::Full),
            "domain" => Ok(Self::Domain),
            other => Err(Error::Config(format!("unknown mailbox naming {other:?}"))),
        }
    }
}

/// Accept/store rules applied to envelope recipients.
///
/// The reject list dominates: a recipient matching it is refused even
/// when the accept list would admit it. Domain lists are matched
/// case-insensitively; the reject list additionally matches the
/// canonical mailbox name exactly, which covers denylisting under
/// `domain` naming.
#[derive(Debug, Clone)]
pub struct AddressPolicy {
    pub naming: MailboxNaming,
    pub default_accept: bool,
    pub accept_domains: Vec<String>,
    pub reject_domains: Vec<String>,
    pub default_store: bool,
    pub store_domains: Vec<String>,
}

impl Default for AddressPolicy {
    fn default() -> Self {
        Self {
            naming: MailboxNaming::default(),
            default_accept: true,
            accept_domains: Vec::new(),
            reject_domains: Vec::new(),
            default_store: true,
            store_domains: Vec::new(),
        }
    }
}

impl AddressPolicy {
    /// Canonical mailbox name for an address, per the naming mode.
    ///
    /// The domain is always lowercased; the resulting name is stored
    /// lowercase. An empty canonical name is a `BadAddress`.
    pub fn mailbox_name(&self, addr: &str) -> Result<String> {
        let (local, domain) = split_address(addr)?;
        let name = match self.naming {
            MailboxNaming::Local => local.to_lowercase(),
            MailboxNaming::Full => {
                if domain.is_empty() {
                    local.to_lowercase()
                } else {
                    format!("{}@{}", local.to_lowercase(), domain.to_lowercase())
                }
            }
            MailboxNaming::Domain => domain.to_lowercase(),
        };
        if name.is_empty() {
            return Err(Error::BadAddress(addr.to_string()));
        }
        Ok(name)
    }

    /// Gate applied by the SMTP ingress at RCPT TO time.
    ///
    /// Returns the canonical mailbox name when the recipient is both
    /// acceptable and storable; a recipient that would never be stored
    /// is refused up front.
    pub fn check_recipient(&self, addr: &str) -> Result<String> {
        let name = self.mailbox_name(addr)?;
        let (_, domain) = split_address(addr)?;
        let domain = domain.to_lowercase();

        if self.reject_domains.iter().any(|d| *d == domain || *d == name) {
            return Err(Error::PolicyRejected(addr.to_string()));
        }
        if !(self.default_accept || self.accept_domains.contains(&domain)) {
            return Err(Error::PolicyRejected(addr.to_string()));
        }
        if !self.stores(addr)? {
            return Err(Error::PolicyRejected(addr.to_string()));
        }
        Ok(name)
    }

    /// Whether a recipient should be stored, per the store policy.
    pub fn stores(&self, addr: &str) -> Result<bool> {
        let name = self.mailbox_name(addr)?;
        let (_, domain) = split_address(addr)?;
        let domain = domain.to_lowercase();

        if self.reject_domains.iter().any(|d| *d == domain || *d == name) {
            return Ok(false);
        }
        Ok(self.default_store || self.store_domains.contains(&domain))
    }
}

/// Split an address into local part and domain.
///
/// A bare local part without `@` is tolerated (the domain is empty);
/// an empty local part is not.
fn split_address(addr: &str) -> Result<(&str, &str)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(Error::BadAddress(addr.to_string()));
    }
    let (local, domain) = match addr.rsplit_once('@') {
        Some((local, domain)) => (local, domain),
        None => (addr, ""),
    };
    if local.is_empty() {
        return Err(Error::BadAddress(addr.to_string()));
    }
    Ok((local, domain))
}
