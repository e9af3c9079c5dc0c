// Stored URLs look like `[scheme://][user[:password]@]host[:port][/path]`; the
// password is AES-128-CBC ciphertext in lowercase hex. Public operations fall
// back to their input on failure.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, error, warn};

pub const DEFAULT_RTSP_PORT: u16 = 554;
pub const DEFAULT_SCHEME: &str = "rtsp";
pub const PASSWORD_MASK: &str = "***";

const BLOCK_LEN: usize = 16;
const PAD_BYTE: u8 = b'.';
const PLACEHOLDER_KEY: &str = "...secret.key...";
const PLACEHOLDER_IV: &str = ".initial.vector.";

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

// Capture groups: 1 scheme, 2 user, 3 password, 4 host, 5 port, 6 path.
const URL_PATTERN: &str = r"^(?:(.+?)://)?(?:(.+?)(?::(.+))?@)?(.+?)(?::(\d+))?(/.*)?$";

static URL_REGEX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(URL_PATTERN)
        .map_err(|err| error!("stream URL pattern failed to compile: {err}"))
        .ok()
});

fn url_regex() -> Option<&'static Regex> {
    URL_REGEX.as_ref()
}

/// Components of a stream URL. `password` is kept exactly as stored, which
/// for persisted configs means ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub scheme: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    /// Path without the leading separator, always ending in `/`.
    pub path: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("stream URL is empty")]
    Empty,
    #[error("stream URL does not match [scheme://][user[:password]@]host[:port][/path]")]
    Malformed,
    #[error("port {0} is out of range")]
    PortOutOfRange(String),
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("ciphertext is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("cipher key or IV has the wrong length")]
    KeyLength,
    #[error("ciphertext padding is invalid")]
    Padding,
    #[error("decrypted password is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Parses a stream URL, filling in `default_port` and `default_scheme` when
/// the URL leaves them out.
pub fn parse_url(
    url: &str,
    default_port: u16,
    default_scheme: &str,
) -> Result<Credentials, ParseError> {
    if url.is_empty() {
        return Err(ParseError::Empty);
    }
    let caps = url_regex()
        .and_then(|regex| regex.captures(url))
        .ok_or(ParseError::Malformed)?;
    let group = |idx: usize| caps.get(idx).map_or("", |m| m.as_str());

    let scheme = match group(1) {
        "" => default_scheme.to_owned(),
        scheme => scheme.to_owned(),
    };
    let port = match group(5) {
        "" => default_port,
        digits => digits
            .parse::<u16>()
            .map_err(|_| ParseError::PortOutOfRange(digits.to_owned()))?,
    };

    let raw_path = group(6);
    let mut path = raw_path.strip_prefix('/').unwrap_or(raw_path).to_owned();
    if !path.ends_with('/') {
        path.push('/');
    }

    Ok(Credentials {
        scheme,
        user: group(2).to_owned(),
        password: group(3).to_owned(),
        host: group(4).to_owned(),
        port,
        path,
    })
}

/// Swaps the password segment of `url` for `replacement`, leaving every other
/// byte untouched. URLs without a password come back unchanged.
#[must_use]
pub fn replace_password(url: &str, replacement: &str) -> String {
    let Some(password) = url_regex()
        .and_then(|regex| regex.captures(url))
        .and_then(|caps| caps.get(3))
    else {
        return url.to_owned();
    };
    let mut out = String::with_capacity(url.len() + replacement.len());
    out.push_str(&url[..password.start()]);
    out.push_str(replacement);
    out.push_str(&url[password.end()..]);
    out
}

/// Masks the stored password so the URL can be shown or logged.
#[must_use]
pub fn decode_for_display(url: &str) -> String {
    match parse_url(url, DEFAULT_RTSP_PORT, DEFAULT_SCHEME) {
        Ok(parts) if !parts.password.is_empty() => replace_password(url, PASSWORD_MASK),
        _ => url.to_owned(),
    }
}

/// Private-network heuristic used to pick alert wording.
#[must_use]
pub fn is_url_local(url: &str) -> bool {
    let Ok(parts) = parse_url(url, DEFAULT_RTSP_PORT, DEFAULT_SCHEME) else {
        return false;
    };
    parts.host.starts_with("192.") || parts.host.starts_with("10.")
}

fn trim_slashes(path: &str) -> &str {
    path.trim_matches('/')
}

/// AES-128-CBC with PKCS#7 padding, key and IV derived from a text secret.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; BLOCK_LEN],
    iv: [u8; BLOCK_LEN],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl CredentialCipher {
    /// Cipher keyed by the installation secret, or by the fixed placeholders
    /// when no installation record is available.
    #[must_use]
    pub fn for_installation(secret: Option<&str>) -> Self {
        match secret {
            Some(secret) => Self::with_key(secret),
            None => {
                warn!("installation secret unavailable, using placeholder credential key");
                Self {
                    key: derive_key(PLACEHOLDER_KEY),
                    iv: derive_iv(PLACEHOLDER_IV),
                }
            }
        }
    }

    /// Cipher whose key and IV both come from `material`.
    #[must_use]
    pub fn with_key(material: &str) -> Self {
        Self {
            key: derive_key(material),
            iv: derive_iv(material),
        }
    }

    pub fn try_encrypt(&self, plain: &str) -> Result<String, CipherError> {
        let encryptor =
            Aes128CbcEnc::new_from_slices(&self.key, &self.iv).map_err(|_| CipherError::KeyLength)?;
        Ok(hex::encode(
            encryptor.encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes()),
        ))
    }

    pub fn try_decrypt(&self, token: &str) -> Result<String, CipherError> {
        let bytes = hex::decode(token)?;
        let decryptor =
            Aes128CbcDec::new_from_slices(&self.key, &self.iv).map_err(|_| CipherError::KeyLength)?;
        let plain = decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(&bytes)
            .map_err(|_| CipherError::Padding)?;
        Ok(String::from_utf8(plain)?)
    }

    /// Encrypts `plain`; an empty string stays empty and failures return the
    /// input unchanged.
    #[must_use]
    pub fn encrypt(&self, plain: &str) -> String {
        if plain.is_empty() {
            return String::new();
        }
        self.try_encrypt(plain).unwrap_or_else(|err| {
            warn!(error = %err, "can't encrypt password");
            plain.to_owned()
        })
    }

    /// Decrypts `token`; an empty string stays empty and failures return the
    /// input unchanged.
    #[must_use]
    pub fn decrypt(&self, token: &str) -> String {
        if token.is_empty() {
            return String::new();
        }
        self.try_decrypt(token).unwrap_or_else(|err| {
            debug!(error = %err, "can't decrypt password, treating it as plain text");
            token.to_owned()
        })
    }
}

fn derive_key(material: &str) -> [u8; BLOCK_LEN] {
    let bytes = material.as_bytes();
    let mut key = [PAD_BYTE; BLOCK_LEN];
    let take = bytes.len().min(BLOCK_LEN);
    key[BLOCK_LEN - take..].copy_from_slice(&bytes[bytes.len() - take..]);
    key
}

fn derive_iv(material: &str) -> [u8; BLOCK_LEN] {
    let bytes = material.as_bytes();
    let mut iv = [PAD_BYTE; BLOCK_LEN];
    let take = bytes.len().min(BLOCK_LEN);
    iv[..take].copy_from_slice(&bytes[..take]);
    iv
}

/// Reversible transform between stored URLs (encrypted password) and
/// connectable URLs (plain password).
#[derive(Debug, Clone)]
pub struct UrlCredentialCodec {
    cipher: CredentialCipher,
}

impl UrlCredentialCodec {
    #[must_use]
    pub fn new(cipher: CredentialCipher) -> Self {
        Self { cipher }
    }

    #[must_use]
    pub fn cipher(&self) -> &CredentialCipher {
        &self.cipher
    }

    #[must_use]
    pub fn encode_for_storage(&self, url: &str) -> String {
        self.transform_password(url, |password| self.cipher.encrypt(password))
    }

    #[must_use]
    pub fn decode_for_connection(&self, url: &str) -> String {
        self.transform_password(url, |password| self.cipher.decrypt(password))
    }

    fn transform_password(&self, url: &str, op: impl FnOnce(&str) -> String) -> String {
        let parts = match parse_url(url, DEFAULT_RTSP_PORT, DEFAULT_SCHEME) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(error = %err, "can't parse stream URL, keeping it as is");
                return url.to_owned();
            }
        };
        if parts.password.is_empty() {
            return url.to_owned();
        }
        replace_password(url, &op(&parts.password))
    }

    /// Rebuilds `scheme://[user[:password]@]host:port[/path]` with the
    /// password decrypted and the port always explicit.
    #[must_use]
    pub fn build_canonical_url(&self, parts: &Credentials) -> String {
        let mut out = String::new();
        if !parts.scheme.is_empty() {
            out.push_str(&parts.scheme);
            out.push_str("://");
        }
        if !parts.user.is_empty() {
            out.push_str(&parts.user);
            if !parts.password.is_empty() {
                out.push(':');
                out.push_str(&self.cipher.decrypt(&parts.password));
            }
            out.push('@');
        }
        out.push_str(&parts.host);
        out.push(':');
        out.push_str(&parts.port.to_string());
        let path = trim_slashes(&parts.path);
        if !path.is_empty() {
            out.push('/');
            out.push_str(path);
        }
        out
    }

    /// Parses a stored URL and returns its connectable form, or the input
    /// itself when it can't be parsed.
    #[must_use]
    pub fn canonical_url(&self, url: &str, default_port: u16, default_scheme: &str) -> String {
        match parse_url(url, default_port, default_scheme) {
            Ok(parts) => self.build_canonical_url(&parts),
            Err(err) => {
                warn!(error = %err, "can't parse stream URL, connecting with it verbatim");
                url.to_owned()
            }
        }
    }

    /// Encrypts the password of a URL coming back from the config editor.
    ///
    /// A masked password (`***`) means "unchanged" and reuses the password of
    /// `previous`. Already encrypted passwords are normalized through
    /// decrypt-then-encrypt so they are never encrypted twice.
    #[must_use]
    pub fn encode_edited_url(&self, edited: &str, previous: Option<&str>) -> String {
        let Ok(parts) = parse_url(edited, DEFAULT_RTSP_PORT, DEFAULT_SCHEME) else {
            return edited.to_owned();
        };
        if parts.password == PASSWORD_MASK
            && let Some(prev) = previous.and_then(|p| parse_url(p, DEFAULT_RTSP_PORT, DEFAULT_SCHEME).ok())
        {
            let reencoded = self.cipher.encrypt(&self.cipher.decrypt(&prev.password));
            return replace_password(edited, &reencoded);
        }
        if parts.password.is_empty() {
            return edited.to_owned();
        }
        let reencoded = self.cipher.encrypt(&self.cipher.decrypt(&parts.password));
        replace_password(edited, &reencoded)
    }
}
