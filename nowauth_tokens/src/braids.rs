//! Strongly-typed credential values
//!
//! Secret values print as `***LABEL***`. The alternate forms (`{:#?}` and
//! `{:#}`) reveal a prefix: `Debug` shows at most `prefix` characters,
//! counting the trailing ellipsis, unless a width is given; `Display` shows
//! the whole value.

use std::{borrow::Cow, fmt};

use aliri_braid::braid;

macro_rules! redacted {
    ($ty:ty, label = $label:literal, prefix = $prefix:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if !f.alternate() {
                    return f.write_str(concat!("***", $label, "***"));
                }
                let shown = prefix_of(&self.0, f.width().unwrap_or($prefix));
                write!(f, "\"{shown}\"")
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if !f.alternate() {
                    return f.write_str(concat!("***", $label, "***"));
                }
                f.write_str(&prefix_of(&self.0, f.width().unwrap_or(usize::MAX)))
            }
        }
    };
}

/// The first `max_chars - 1` characters of `secret` followed by `…`, or all of
/// `secret` if it is short enough
fn prefix_of(secret: &str, max_chars: usize) -> Cow<'_, str> {
    if max_chars <= 1 {
        return Cow::Borrowed("…");
    }
    match secret.char_indices().nth(max_chars - 1) {
        Some((end, _)) => Cow::Owned(format!("{}…", &secret[..end])),
        None => Cow::Borrowed(secret),
    }
}

/// An OAuth client ID
#[braid(serde)]
pub struct ClientId;

/// An OAuth client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

redacted!(ClientSecretRef, label = "CLIENT SECRET", prefix = 5);

/// An access token, or a pre-built `Basic` authorization value
///
/// A `Basic` value starts with the fixed `Basic ` scheme, so the revealed
/// prefix is long enough to show a few characters past it.
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef, label = "ACCESS TOKEN", prefix = 15);

/// A refresh token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

redacted!(RefreshTokenRef, label = "REFRESH TOKEN", prefix = 5);

/// A username for basic authentication
#[braid(serde)]
pub struct Username;

/// A password for basic authentication
///
/// Passwords are short and often guessable from a few characters, so the
/// alternate `Debug` form reveals only the ellipsis.
#[braid(serde, debug = "owned", display = "owned")]
pub struct Password;

redacted!(PasswordRef, label = "PASSWORD", prefix = 1);
