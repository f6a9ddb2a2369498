//! Passphrase resolution and random name generation for new LUKS volumes.

use crate::error::{LuksError, LuksResult};
use rand::distributions::Alphanumeric;
use rand::Rng;
use zeroize::Zeroizing;

/// Passphrase material that is wiped from memory on drop.
pub type Secret = Zeroizing<String>;

/// Length of generated mapping names.
pub const CRYPTDEV_NAME_LEN: usize = 8;

/// Pick the passphrase used to format a volume.
///
/// An explicit passphrase must come with an identical confirmation. With
/// neither supplied, a fresh alphanumeric secret of `length` characters is
/// generated.
pub fn resolve_secret(
    length: Option<usize>,
    passphrase: Option<&str>,
    confirmation: Option<&str>,
) -> LuksResult<Secret> {
    match (passphrase, confirmation) {
        (Some(pass), Some(confirm)) => {
            if pass == confirm {
                Ok(Zeroizing::new(pass.to_string()))
            } else {
                Err(LuksError::PassphraseMismatch)
            }
        }
        (Some(_), None) => Err(LuksError::PassphraseMissing("confirmation passphrase")),
        (None, Some(_)) => Err(LuksError::PassphraseMissing("passphrase")),
        (None, None) => match length {
            Some(0) => Err(LuksError::InvalidConfig(
                "passphrase length must be greater than zero".into(),
            )),
            Some(len) => Ok(generate_secret(len)),
            None => Err(LuksError::PassphraseMissing("passphrase")),
        },
    }
}

/// Random secret drawn from `[A-Za-z0-9]`.
pub fn generate_secret(length: usize) -> Secret {
    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    Zeroizing::new(secret)
}

/// Random lowercase mapping name, e.g. `qzkwmfar`.
pub fn random_cryptdev_name() -> String {
    let mut rng = rand::thread_rng();
    (0..CRYPTDEV_NAME_LEN)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

/// Frame a secret for tools that read one passphrase line from stdin.
pub(crate) fn stdin_line(secret: &str) -> Zeroizing<Vec<u8>> {
    let mut bytes = Vec::with_capacity(secret.len() + 1);
    bytes.extend_from_slice(secret.as_bytes());
    bytes.push(b'\n');
    Zeroizing::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_pair_is_returned_verbatim() {
        let secret = resolve_secret(Some(8), Some("s3cret pass"), Some("s3cret pass")).unwrap();
        assert_eq!(secret.as_str(), "s3cret pass");
    }

    #[test]
    fn mismatched_pair_is_rejected() {
        let err = resolve_secret(None, Some("one"), Some("two")).unwrap_err();
        assert!(matches!(err, LuksError::PassphraseMismatch));
    }

    #[test]
    fn missing_confirmation_is_rejected() {
        let err = resolve_secret(Some(8), Some("one"), None).unwrap_err();
        assert!(matches!(err, LuksError::PassphraseMissing("confirmation passphrase")));
        let err = resolve_secret(None, None, None).unwrap_err();
        assert!(matches!(err, LuksError::PassphraseMissing("passphrase")));
    }

    #[test]
    fn generated_secret_has_length_and_alphabet() {
        for len in [1usize, 8, 64] {
            let secret = resolve_secret(Some(len), None, None).unwrap();
            assert_eq!(secret.len(), len);
            assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        }
        assert!(resolve_secret(Some(0), None, None).is_err());
    }

    #[test]
    fn cryptdev_names_are_lowercase() {
        let name = random_cryptdev_name();
        assert_eq!(name.len(), CRYPTDEV_NAME_LEN);
        assert!(name.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn stdin_line_appends_newline() {
        assert_eq!(&stdin_line("abc")[..], b"abc\n");
    }
}
