//! Shared access signatures: signing, token formatting, and parsing.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::Sha256;

use crate::Error;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "SharedAccessSignature ";

/// Everything but alphanumerics and `-_.~` is escaped.
const QUERY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Query-component escaping with space as `+`. A literal `%` becomes
/// `%25`, so every `%20` in the output came from a space.
fn query_escape(s: &str) -> String {
    utf8_percent_encode(s, QUERY).to_string().replace("%20", "+")
}

/// Sign `"<url-encoded resource>\n<expiry unix seconds>"` with HMAC-SHA256
/// under the base64-decoded key; returns the base64 signature.
pub fn sign(resource: &str, key: &str, expiry: DateTime<Utc>) -> Result<String, Error> {
    let key = BASE64.decode(key)?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| Error::Config(format!("HMAC error: {e}")))?;
    mac.update(format!("{}\n{}", query_escape(resource), expiry.timestamp()).as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// A signed token for one resource, valid until `expiry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedAccessSignature {
    pub resource: String,
    pub signature: String,
    pub expiry: DateTime<Utc>,
    pub policy_name: Option<String>,
}

impl SharedAccessSignature {
    pub fn new(
        resource: &str,
        policy_name: Option<&str>,
        key: &str,
        expiry: DateTime<Utc>,
    ) -> Result<Self, Error> {
        Ok(Self {
            resource: resource.to_string(),
            signature: sign(resource, key, expiry)?,
            // Signatures cover whole seconds only.
            expiry: truncate_to_seconds(expiry)?,
            policy_name: policy_name.filter(|p| !p.is_empty()).map(str::to_string),
        })
    }
}

fn truncate_to_seconds(t: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
    Utc.timestamp_opt(t.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::InvalidToken(format!("expiry out of range: {t}")))
}

impl fmt::Display for SharedAccessSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{TOKEN_PREFIX}sr={}&sig={}&se={}",
            query_escape(&self.resource),
            query_escape(&self.signature),
            self.expiry.timestamp()
        )?;
        if let Some(skn) = &self.policy_name {
            write!(f, "&skn={}", query_escape(skn))?;
        }
        Ok(())
    }
}

impl FromStr for SharedAccessSignature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = s
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| Error::InvalidToken(format!("missing {TOKEN_PREFIX:?} prefix")))?;

        let mut resource = None;
        let mut signature = None;
        let mut expiry = None;
        let mut policy_name = None;
        for (k, v) in url::form_urlencoded::parse(fields.as_bytes()) {
            match k.as_ref() {
                "sr" => resource = Some(v.into_owned()),
                "sig" => signature = Some(v.into_owned()),
                "se" => expiry = Some(v.into_owned()),
                "skn" => policy_name = Some(v.into_owned()),
                other => {
                    return Err(Error::InvalidToken(format!("unknown field {other:?}")));
                }
            }
        }

        let missing = |name: &str| Error::InvalidToken(format!("missing {name}"));
        let se = expiry.ok_or_else(|| missing("se"))?;
        let secs: i64 = se
            .parse()
            .map_err(|e| Error::InvalidToken(format!("se={se:?}: {e}")))?;
        let expiry = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| Error::InvalidToken(format!("se={secs} out of range")))?;

        Ok(Self {
            resource: resource.ok_or_else(|| missing("sr"))?,
            signature: signature.ok_or_else(|| missing("sig"))?,
            expiry,
            policy_name,
        })
    }
}

/// Signing credentials for one hub.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedAccessKey {
    pub host_name: String,
    pub key_name: String,
    pub key: String,
}

impl fmt::Debug for SharedAccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAccessKey")
            .field("host_name", &self.host_name)
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SharedAccessKey {
    /// Parse `HostName=..;SharedAccessKeyName=..;SharedAccessKey=..`.
    pub fn from_connection_string(s: &str) -> Result<Self, Error> {
        let mut host_name = None;
        let mut key_name = None;
        let mut key = None;
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("malformed connection string segment {part:?}")))?;
            match k {
                "HostName" => host_name = Some(v.to_string()),
                "SharedAccessKeyName" => key_name = Some(v.to_string()),
                "SharedAccessKey" => key = Some(v.to_string()),
                _ => tracing::debug!(key = k, "ignoring connection string field"),
            }
        }
        let missing = |name: &str| Error::Config(format!("connection string is missing {name}"));
        let sak = Self {
            host_name: host_name.ok_or_else(|| missing("HostName"))?,
            key_name: key_name.ok_or_else(|| missing("SharedAccessKeyName"))?,
            key: key.ok_or_else(|| missing("SharedAccessKey"))?,
        };
        BASE64.decode(&sak.key)?;
        Ok(sak)
    }

    /// Generate a signature for `resource` expiring `lifetime` from now.
    pub fn token(&self, resource: &str, lifetime: Duration) -> Result<SharedAccessSignature, Error> {
        let lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|e| Error::Config(format!("token lifetime: {e}")))?;
        SharedAccessSignature::new(resource, Some(&self.key_name), &self.key, Utc::now() + lifetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

    fn expiry() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    #[test]
    fn sign_is_deterministic() {
        let a = sign("my-hub.azure-devices.net", KEY, expiry()).unwrap();
        let b = sign("my-hub.azure-devices.net", KEY, expiry()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, sign("other-hub.azure-devices.net", KEY, expiry()).unwrap());
    }

    #[test]
    fn sign_matches_manual_hmac() {
        let key = BASE64.decode(KEY).unwrap();
        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(b"my-hub.azure-devices.net%2Fdevices\n1700000000");
        let expected = BASE64.encode(mac.finalize().into_bytes());
        assert_eq!(
            sign("my-hub.azure-devices.net/devices", KEY, expiry()).unwrap(),
            expected
        );
    }

    #[test]
    fn query_escape_reserved_characters() {
        assert_eq!(query_escape("h/devices/dev*1~x"), "h%2Fdevices%2Fdev%2A1~x");
        assert_eq!(query_escape("a b+c=d&e%f"), "a+b%2Bc%3Dd%26e%25f");
        assert_eq!(query_escape("A-z_0.9"), "A-z_0.9");
    }

    #[test]
    fn token_escapes_device_scoped_resource() {
        let sas = SharedAccessSignature::new("h/devices/dev*1~x", None, KEY, expiry()).unwrap();
        assert!(
            sas.to_string()
                .starts_with("SharedAccessSignature sr=h%2Fdevices%2Fdev%2A1~x&sig="),
            "got: {sas}"
        );

        let key = BASE64.decode(KEY).unwrap();
        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(b"h%2Fdevices%2Fdev%2A1~x\n1700000000");
        assert_eq!(sas.signature, BASE64.encode(mac.finalize().into_bytes()));

        let parsed: SharedAccessSignature = sas.to_string().parse().unwrap();
        assert_eq!(parsed.resource, "h/devices/dev*1~x");
    }

    #[test]
    fn sign_rejects_invalid_key() {
        let err = sign("r", "not base64!!", expiry()).unwrap_err();
        assert!(matches!(err, Error::InvalidKeyEncoding(_)), "got: {err}");
    }

    #[test]
    fn token_string_format() {
        let sas = SharedAccessSignature::new("my-hub.azure-devices.net", Some("service"), KEY, expiry())
            .unwrap();
        let s = sas.to_string();
        assert!(s.starts_with("SharedAccessSignature sr=my-hub.azure-devices.net&sig="));
        assert!(s.contains("&se=1700000000"));
        assert!(s.ends_with("&skn=service"));
        // base64 '+', '/' and '=' must be percent-encoded
        let sig_field = s.split("&sig=").nth(1).unwrap().split('&').next().unwrap();
        assert!(!sig_field.contains('+') && !sig_field.contains('/') && !sig_field.contains('='));
    }

    #[test]
    fn token_without_policy_omits_skn() {
        let sas = SharedAccessSignature::new("r", None, KEY, expiry()).unwrap();
        assert!(!sas.to_string().contains("skn="));
    }

    #[test]
    fn token_round_trips_through_parser() {
        let sas = SharedAccessSignature::new(
            "my-hub.azure-devices.net/devices/dev 1",
            Some("iothubowner"),
            KEY,
            expiry(),
        )
        .unwrap();
        let parsed: SharedAccessSignature = sas.to_string().parse().unwrap();
        assert_eq!(parsed, sas);
    }

    #[test]
    fn expiry_truncated_to_seconds() {
        let t = expiry() + chrono::Duration::milliseconds(750);
        let sas = SharedAccessSignature::new("r", None, KEY, t).unwrap();
        assert_eq!(sas.expiry, expiry());
        let parsed: SharedAccessSignature = sas.to_string().parse().unwrap();
        assert_eq!(parsed, sas);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("sr=a&sig=b&se=1".parse::<SharedAccessSignature>().is_err());
        assert!(
            "SharedAccessSignature sr=a&se=1"
                .parse::<SharedAccessSignature>()
                .is_err()
        );
        assert!(
            "SharedAccessSignature sr=a&sig=b&se=soon"
                .parse::<SharedAccessSignature>()
                .is_err()
        );
    }

    #[test]
    fn connection_string_parsing() {
        let sak = SharedAccessKey::from_connection_string(&format!(
            "HostName=my-hub.azure-devices.net;SharedAccessKeyName=service;SharedAccessKey={KEY}"
        ))
        .unwrap();
        assert_eq!(sak.host_name, "my-hub.azure-devices.net");
        assert_eq!(sak.key_name, "service");
        assert_eq!(sak.key, KEY);
        assert!(!format!("{sak:?}").contains(KEY));
    }

    #[test]
    fn connection_string_missing_key() {
        let err =
            SharedAccessKey::from_connection_string("HostName=h;SharedAccessKeyName=service")
                .unwrap_err();
        assert!(err.to_string().contains("SharedAccessKey"), "got: {err}");
    }

    #[test]
    fn key_token_expires_after_lifetime() {
        let sak = SharedAccessKey {
            host_name: "h".into(),
            key_name: "service".into(),
            key: KEY.into(),
        };
        let before = Utc::now();
        let sas = sak.token("h", Duration::from_secs(3600)).unwrap();
        let delta = sas.expiry - before;
        assert!(delta.num_seconds() >= 3599 && delta.num_seconds() <= 3601);
        assert_eq!(sas.policy_name.as_deref(), Some("service"));
    }
}
