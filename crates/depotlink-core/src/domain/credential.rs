//! One-use credential value
//!
//! A password handed from the credential provider to the login path. It is
//! consumed by the one call that uses it and zeroed when dropped, whichever
//! way that call exits.

use std::fmt;
use zeroize::Zeroizing;

/// A password that can be revealed exactly once.
///
/// Not `Clone`: every login attempt fetches its own copy from the provider.
pub struct OneUseCredential {
    secret: Zeroizing<String>,
}

impl OneUseCredential {
    /// Wrap a password. Empty passwords are treated as "no credential".
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = Zeroizing::new(secret.into());
        if secret.is_empty() {
            None
        } else {
            Some(Self { secret })
        }
    }

    /// Consume the credential, handing back a buffer that zeroes itself on drop
    pub fn reveal(self) -> Zeroizing<String> {
        self.secret
    }

    /// Run `f` with the cleartext; the buffer is zeroed when `f` returns
    pub fn use_once<T>(self, f: impl FnOnce(&str) -> T) -> T {
        let secret = self.reveal();
        f(secret.as_str())
    }
}

impl fmt::Debug for OneUseCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OneUseCredential([REDACTED])")
    }
}
