//! Password authentication.
use md5::{Digest, Md5};
use std::fmt;

/// Salted double md5 password, `"md5" + md5hex(md5hex(password + user) + salt)`.
pub fn md5_password(user: &str, pass: &str, salt: [u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(pass);
    md5.update(user);
    let inner = format!("{:x}", md5.finalize_reset());

    md5.update(inner);
    md5.update(salt);
    format!("md5{:x}", md5.finalize())
}

/// Server requested an authentication method that is not supported.
///
/// Only cleartext and md5 password are supported.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedAuth {
    method: &'static str,
}

impl UnsupportedAuth {
    pub(crate) fn new(method: &'static str) -> Self {
        Self { method }
    }

    /// Name of the requested method.
    pub fn method(&self) -> &'static str {
        self.method
    }
}

impl std::error::Error for UnsupportedAuth { }

impl fmt::Display for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported authentication method: {}", self.method)
    }
}

impl fmt::Debug for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
